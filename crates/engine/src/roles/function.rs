// SPDX-License-Identifier: Apache-2.0

//! The function role: maps drops one-to-one, preserving `(scope, index)`.

use crate::error::{Error, TaskResult, push_failure};
use crate::node::{PipePort, RoleKind};
use crate::worker::{Role, TaskPool, Worker, WorkerCx};
use dropflow_pipe::{Pipe, PipeMonitoring};
use std::num::NonZeroUsize;
use std::sync::Arc;

type ApplyFn<I, O> = Arc<dyn Fn(&I) -> TaskResult<O> + Send + Sync>;

/// Reads from the input pipe, applies the user function, and pushes the
/// result to the output pipe under the input drop's `(scope, index)`.
///
/// With concurrency above one, invocations overlap and may complete out of
/// order; the output pipe restores the supply order from the preserved
/// indices.
pub struct Function<I, O> {
    input: Arc<Pipe<I>>,
    output: Arc<Pipe<O>>,
    apply: ApplyFn<I, O>,
}

impl<I: Send + Sync + 'static, O: Send + 'static> Function<I, O> {
    /// Creates a function worker mapping `input` onto `output`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        concurrency: NonZeroUsize,
        input: Arc<Pipe<I>>,
        output: Arc<Pipe<O>>,
        apply: impl Fn(&I) -> TaskResult<O> + Send + Sync + 'static,
    ) -> Worker<Self> {
        Worker::new(
            name,
            concurrency,
            Self {
                input,
                output,
                apply: Arc::new(apply),
            },
        )
    }
}

#[async_trait::async_trait]
impl<I: Send + Sync + 'static, O: Send + 'static> Role for Function<I, O> {
    fn kind(&self) -> RoleKind {
        RoleKind::Function
    }

    fn inputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.input)]
    }

    fn outputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.output)]
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
            let apply = self.apply.clone();
            let output = self.output.clone();
            pool.submit(async move {
                match cx.invoke(|| apply(&droplet.value)).await {
                    Ok(value) => {
                        let out = droplet.with_value(value);
                        tokio::select! {
                            _ = cx.token().cancelled() => cx.count_cancelled(),
                            pushed = output.push(out) => {
                                if let Err(error) = pushed {
                                    cx.fail(push_failure(cx.name(), output.name(), &error));
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
        self.output.set_end_of_input();
        Ok(())
    }
}
