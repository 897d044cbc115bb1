// SPDX-License-Identifier: Apache-2.0

//! The consumer role: runs a side effect; no output.

use crate::error::{Error, TaskResult};
use crate::node::{PipePort, RoleKind};
use crate::worker::{Role, TaskPool, Worker, WorkerCx};
use dropflow_pipe::Pipe;
use std::num::NonZeroUsize;
use std::sync::Arc;

type AcceptFn<D> = Arc<dyn Fn(&D) -> TaskResult<()> + Send + Sync>;

/// Reads from the input pipe and runs the user side effect on every drop.
/// The pipeline's terminal stage.
///
/// With concurrency one, the callback observes drops in strict supply
/// order.
pub struct Consumer<D> {
    input: Arc<Pipe<D>>,
    accept: AcceptFn<D>,
}

impl<D: Send + Sync + 'static> Consumer<D> {
    /// Creates a consumer worker draining `input`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        concurrency: NonZeroUsize,
        input: Arc<Pipe<D>>,
        accept: impl Fn(&D) -> TaskResult<()> + Send + Sync + 'static,
    ) -> Worker<Self> {
        Worker::new(
            name,
            concurrency,
            Self {
                input,
                accept: Arc::new(accept),
            },
        )
    }
}

#[async_trait::async_trait]
impl<D: Send + Sync + 'static> Role for Consumer<D> {
    fn kind(&self) -> RoleKind {
        RoleKind::Consumer
    }

    fn inputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.input)]
    }

    fn outputs(&self) -> Vec<PipePort> {
        Vec::new()
    }

    async fn work(&self, cx: &WorkerCx) -> Result<(), Error> {
        let mut pool = TaskPool::new(cx);
        loop {
            let droplet = tokio::select! {
                _ = cx.token().cancelled() => break,
                popped = self.input.pop() => match popped {
                    Some(droplet) => droplet,
                    None => break,
                },
            };
            let cx = cx.clone();
            let accept = self.accept.clone();
            pool.submit(async move {
                if let Err(error) = cx.invoke(|| accept(&droplet.value)).await {
                    cx.fail(Error::Task {
                        worker: cx.name().to_owned(),
                        message: error.to_string(),
                    });
                }
            })
            .await;
        }
        pool.drain().await;
        Ok(())
    }

    async fn internal_close(&self, _cx: &WorkerCx) -> Result<(), Error> {
        Ok(())
    }
}
