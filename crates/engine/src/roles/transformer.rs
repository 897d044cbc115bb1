// SPDX-License-Identifier: Apache-2.0

//! The transformer role: maps each drop to any number of drops in a new
//! scope.

use crate::error::{Error, TaskResult, push_failure};
use crate::node::{PipePort, RoleKind};
use crate::worker::{Role, TaskPool, Worker, WorkerCx};
use dropflow_pipe::{Pipe, PipeMonitoring, SupplyPipe};
use std::num::NonZeroUsize;
use std::sync::Arc;

type TransformFn<I, O> = Arc<dyn Fn(&I) -> TaskResult<Vec<O>> + Send + Sync>;
type LastFn<O> = Arc<dyn Fn() -> TaskResult<Vec<O>> + Send + Sync>;

/// Reads from the input pipe, applies the user transform — which may yield
/// zero or more values per drop — and pushes every value into the output
/// supply pipe. The output is a new index scope: transformation is a scope
/// boundary.
///
/// An optional `last_drops` hook is invoked exactly once after the input
/// reached end-of-input, letting a stateful transform flush whatever it
/// still holds (e.g. a partially assembled word).
pub struct Transformer<I, O> {
    input: Arc<Pipe<I>>,
    output: Arc<SupplyPipe<O>>,
    transform: TransformFn<I, O>,
    last: Option<LastFn<O>>,
}

impl<I: Send + Sync + 'static, O: Send + 'static> Transformer<I, O> {
    /// Creates a transformer worker cutting `input` into `output`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        concurrency: NonZeroUsize,
        input: Arc<Pipe<I>>,
        output: Arc<SupplyPipe<O>>,
        transform: impl Fn(&I) -> TaskResult<Vec<O>> + Send + Sync + 'static,
    ) -> Worker<Self> {
        Worker::new(
            name,
            concurrency,
            Self {
                input,
                output,
                transform: Arc::new(transform),
                last: None,
            },
        )
    }

    /// Creates a transformer with a `last_drops` hook, invoked once after
    /// end-of-input.
    #[must_use]
    pub fn with_last_drops(
        name: impl Into<String>,
        concurrency: NonZeroUsize,
        input: Arc<Pipe<I>>,
        output: Arc<SupplyPipe<O>>,
        transform: impl Fn(&I) -> TaskResult<Vec<O>> + Send + Sync + 'static,
        last: impl Fn() -> TaskResult<Vec<O>> + Send + Sync + 'static,
    ) -> Worker<Self> {
        Worker::new(
            name,
            concurrency,
            Self {
                input,
                output,
                transform: Arc::new(transform),
                last: Some(Arc::new(last)),
            },
        )
    }
}

#[async_trait::async_trait]
impl<I: Send + Sync + 'static, O: Send + 'static> Role for Transformer<I, O> {
    fn kind(&self) -> RoleKind {
        RoleKind::Transformer
    }

    fn inputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.input)]
    }

    fn outputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.output.pipe())]
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
            let transform = self.transform.clone();
            let output = self.output.clone();
            pool.submit(async move {
                match cx.invoke(|| transform(&droplet.value)).await {
                    Ok(values) => {
                        for value in values {
                            let failed = tokio::select! {
                                _ = cx.token().cancelled() => {
                                    cx.count_cancelled();
                                    true
                                }
                                pushed = output.push(value) => match pushed {
                                    Ok(_) => false,
                                    Err(error) => {
                                        cx.fail(push_failure(cx.name(), output.name(), &error));
                                        true
                                    }
                                },
                            };
                            if failed {
                                break;
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

    async fn internal_close(&self, cx: &WorkerCx) -> Result<(), Error> {
        let mut result = Ok(());
        if let Some(last) = &self.last {
            if !cx.token().is_cancelled() {
                match last() {
                    Ok(values) => {
                        for value in values {
                            let stop = tokio::select! {
                                _ = cx.token().cancelled() => true,
                                pushed = self.output.push(value) => match pushed {
                                    Ok(_) => false,
                                    Err(error) => {
                                        result = Err(push_failure(
                                            cx.name(),
                                            self.output.name(),
                                            &error,
                                        ));
                                        true
                                    }
                                },
                            };
                            if stop {
                                break;
                            }
                        }
                    }
                    Err(error) => {
                        result = Err(Error::Task {
                            worker: cx.name().to_owned(),
                            message: error.to_string(),
                        });
                    }
                }
            }
        }
        self.output.set_end_of_input();
        result
    }
}
