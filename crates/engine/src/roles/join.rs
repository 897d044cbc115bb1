// SPDX-License-Identifier: Apache-2.0

//! The join role: fans several inputs into one output supply pipe.

use crate::error::{Error, push_failure};
use crate::node::{PipePort, RoleKind};
use crate::worker::{Role, TaskPool, Worker, WorkerCx};
use dropflow_pipe::{Pipe, PipeMonitoring, SupplyPipe};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Reads from all of its inputs concurrently and pushes every drop into one
/// output supply pipe. The join is a scope boundary: drops are renumbered
/// by the output's scope, and no order is defined across the joined inputs.
///
/// An input reaching end-of-input ends that input's loop only; the
/// remaining inputs keep flowing until each has ended.
pub struct Join<D> {
    inputs: Vec<Arc<Pipe<D>>>,
    output: Arc<SupplyPipe<D>>,
}

impl<D: Send + 'static> Join<D> {
    /// Creates a join worker merging `inputs` into `output`.
    ///
    /// The worker runs one loop per input, so its concurrency equals the
    /// number of inputs. The builder rejects joins with fewer than two
    /// inputs.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<Arc<Pipe<D>>>,
        output: Arc<SupplyPipe<D>>,
    ) -> Worker<Self> {
        let concurrency = NonZeroUsize::new(inputs.len()).unwrap_or(NonZeroUsize::MIN);
        Worker::new(name, concurrency, Self { inputs, output })
    }
}

#[async_trait::async_trait]
impl<D: Send + 'static> Role for Join<D> {
    fn kind(&self) -> RoleKind {
        RoleKind::Join
    }

    fn inputs(&self) -> Vec<PipePort> {
        self.inputs.iter().map(PipePort::of).collect()
    }

    fn outputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.output.pipe())]
    }

    async fn work(&self, cx: &WorkerCx) -> Result<(), Error> {
        let mut pool = TaskPool::new(cx);
        for input in &self.inputs {
            let cx = cx.clone();
            let input = input.clone();
            let output = self.output.clone();
            pool.submit(async move {
                loop {
                    let droplet = tokio::select! {
                        _ = cx.token().cancelled() => {
                            cx.count_cancelled();
                            break;
                        }
                        popped = input.pop() => match popped {
                            Some(droplet) => droplet,
                            None => break,
                        },
                    };
                    let failed = tokio::select! {
                        _ = cx.token().cancelled() => {
                            cx.count_cancelled();
                            true
                        }
                        pushed = output.push(droplet.value) => match pushed {
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
