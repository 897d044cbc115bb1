// SPDX-License-Identifier: Apache-2.0

//! The fork role: fans every drop out to each of its outputs.

use crate::error::{Error, push_failure};
use crate::node::{PipePort, RoleKind};
use crate::worker::{Role, TaskPool, Worker, WorkerCx};
use dropflow_pipe::{Pipe, PipeMonitoring};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Reads from one input and pushes every drop to each of its outputs,
/// preserving `(scope, index)` on all of them, so each branch observes the
/// full stream in supply order.
///
/// A fork whose outputs have differing base capacities is structurally
/// unbalanced — the smallest capacity throttles every branch — and is
/// reported by the graph validator as `UNBALANCED_FORK`.
pub struct Fork<D: Clone> {
    input: Arc<Pipe<D>>,
    outputs: Vec<Arc<Pipe<D>>>,
}

impl<D: Clone + Send + 'static> Fork<D> {
    /// Creates a fork worker fanning `input` out to `outputs`.
    ///
    /// The builder rejects forks with fewer than two outputs.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        concurrency: NonZeroUsize,
        input: Arc<Pipe<D>>,
        outputs: Vec<Arc<Pipe<D>>>,
    ) -> Worker<Self> {
        Worker::new(name, concurrency, Self { input, outputs })
    }
}

#[async_trait::async_trait]
impl<D: Clone + Send + 'static> Role for Fork<D> {
    fn kind(&self) -> RoleKind {
        RoleKind::Fork
    }

    fn inputs(&self) -> Vec<PipePort> {
        vec![PipePort::of(&self.input)]
    }

    fn outputs(&self) -> Vec<PipePort> {
        self.outputs.iter().map(PipePort::of).collect()
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
            let outputs = self.outputs.clone();
            pool.submit(async move {
                for output in &outputs {
                    let copy = droplet.clone();
                    let failed = tokio::select! {
                        _ = cx.token().cancelled() => {
                            cx.count_cancelled();
                            true
                        }
                        pushed = output.push(copy) => match pushed {
                            Ok(()) => false,
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
        for output in &self.outputs {
            output.set_end_of_input();
        }
        Ok(())
    }
}
