// SPDX-License-Identifier: Apache-2.0

//! The action role: runs a side effect and forwards the drop.

use crate::error::{Error, TaskResult, push_failure};
use crate::node::{PipePort, RoleKind};
use crate::worker::{Role, TaskPool, Worker, WorkerCx};
use dropflow_pipe::{Pipe, PipeMonitoring};
use std::num::NonZeroUsize;
use std::sync::Arc;

type ActFn<D> = Arc<dyn Fn(&D) -> TaskResult<()> + Send + Sync>;

/// Reads from the input pipe, runs the user side effect, and forwards the
/// unchanged drop — `(scope, index)` included — to the optional output.
/// Without an output the action is a sink, like a [`Consumer`].
///
/// [`Consumer`]: crate::roles::Consumer
pub struct Action<D> {
    input: Arc<Pipe<D>>,
    output: Option<Arc<Pipe<D>>>,
    act: ActFn<D>,
}

impl<D: Send + Sync + 'static> Action<D> {
    /// Creates an action worker between `input` and `output`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        concurrency: NonZeroUsize,
        input: Arc<Pipe<D>>,
        output: Option<Arc<Pipe<D>>>,
        act: impl Fn(&D) -> TaskResult<()> + Send + Sync + 'static,
    ) -> Worker<Self> {
        Worker::new(
            name,
            concurrency,
            Self {
                input,
                output,
                act: Arc::new(act),
            },
        )
    }
}

#[async_trait::async_trait]
impl<D: Send + Sync + 'static> Role for Action<D> {
    fn kind(&self) -> RoleKind {
        RoleKind::Action
    }

    fn inputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.input)]
    }

    fn outputs(&self) -> Vec<PipePort> {
        self.output.iter().map(PipePort::of).collect()
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
            let act = self.act.clone();
            let output = self.output.clone();
            pool.submit(async move {
                match cx.invoke(|| act(&droplet.value)).await {
                    Ok(()) => {
                        if let Some(output) = output {
                            tokio::select! {
                                _ = cx.token().cancelled() => cx.count_cancelled(),
                                pushed = output.push(droplet) => {
                                    if let Err(error) = pushed {
                                        cx.fail(push_failure(cx.name(), output.name(), &error));
                                    }
                                }
                            }
                        }
                    }
                    Err(error) => cx.fail(Error::Task {
                        worker: cx.name().to_owned(),
                        message: error.to_string(),
                    }),
                }
            })
            .await;
        }
        pool.drain().await;
        Ok(())
    }

    async fn internal_close(&self, _cx: &WorkerCx) -> Result<(), Error> {
        if let Some(output) = &self.output {
            output.set_end_of_input();
        }
        Ok(())
    }
}
