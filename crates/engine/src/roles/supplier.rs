// SPDX-License-Identifier: Apache-2.0

//! The supplier role: originates drops into a supply pipe.

use crate::error::{Error, TaskResult, push_failure};
use crate::node::{PipePort, RoleKind};
use crate::worker::{Role, TaskPool, Worker, WorkerCx};
use dropflow_pipe::{Droplet, PipeMonitoring, SupplyPipe};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

type GetFn<O> = Arc<dyn Fn() -> TaskResult<Option<O>> + Send + Sync>;

/// Outcome of one serialized acquisition step.
enum Supplied<O> {
    Stamped(Droplet<O>),
    Filtered,
    Exhausted,
}

/// Runs `concurrency` parallel loops, each repeatedly calling the user `get`
/// callback; a present value is pushed to the output supply pipe, `None`
/// stops that loop. Once all loops stop, end-of-input is signaled on the
/// output.
///
/// The callback is shared by all loops and must therefore be thread-safe; a
/// stateful source typically wraps its state in a mutex. Acquisition and
/// index stamping happen under one internal lock, so the supply order always
/// matches the order in which `get` produced the values, no matter how the
/// loops interleave their pushes.
pub struct Supplier<O> {
    output: Arc<SupplyPipe<O>>,
    get: GetFn<O>,
    /// Serializes `get` with index stamping across the loops.
    order: Arc<Mutex<()>>,
}

impl<O: Send + 'static> Supplier<O> {
    /// Creates a supplier worker feeding `output`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        concurrency: NonZeroUsize,
        output: Arc<SupplyPipe<O>>,
        get: impl Fn() -> TaskResult<Option<O>> + Send + Sync + 'static,
    ) -> Worker<Self> {
        Worker::new(
            name,
            concurrency,
            Self {
                output,
                get: Arc::new(get),
                order: Arc::new(Mutex::new(())),
            },
        )
    }

    pub(crate) fn output_port(&self) -> PipePort {
        PipePort::of(&self.output.pipe())
    }
}

#[async_trait::async_trait]
impl<O: Send + 'static> Role for Supplier<O> {
    fn kind(&self) -> RoleKind {
        RoleKind::Supplier
    }

    fn inputs(&self) -> Vec<PipePort> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<PipePort> {
        vec![self.output_port()]
    }

    async fn work(&self, cx: &WorkerCx) -> Result<(), Error> {
        let mut pool = TaskPool::new(cx);
        for _ in 0..cx.concurrency() {
            let cx = cx.clone();
            let get = self.get.clone();
            let order = self.order.clone();
            let output = self.output.clone();
            pool.submit(async move {
                let pipe = output.pipe();
                loop {
                    if cx.token().is_cancelled() {
                        cx.count_cancelled();
                        break;
                    }
                    let supplied = cx
                        .invoke(|| {
                            let _serial = order.lock();
                            match get()? {
                                Some(value) => Ok(match output.stamp(value) {
                                    Some(droplet) => Supplied::Stamped(droplet),
                                    None => Supplied::Filtered,
                                }),
                                None => Ok(Supplied::Exhausted),
                            }
                        })
                        .await;
                    match supplied {
                        Ok(Supplied::Stamped(droplet)) => {
                            let failed = tokio::select! {
                                _ = cx.token().cancelled() => {
                                    cx.count_cancelled();
                                    true
                                }
                                pushed = pipe.push(droplet) => match pushed {
                                    Ok(()) => false,
                                    Err(error) => {
                                        cx.fail(push_failure(cx.name(), pipe.name(), &error));
                                        true
                                    }
                                },
                            };
                            if failed {
                                break;
                            }
                        }
                        Ok(Supplied::Filtered) => {}
                        Ok(Supplied::Exhausted) => break,
                        Err(error) => {
                            cx.fail(Error::Task {
                                worker: cx.name().to_owned(),
                                message: error.to_string(),
                            });
                            break;
                        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{PipelineWorker, WorkerMonitoring};
    use crate::worker::WorkerState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_loops_preserve_acquisition_order() {
        let supply = SupplyPipe::new("numbers", cap(4));
        let next = Arc::new(AtomicUsize::new(0));
        let source = next.clone();
        let supplier = Arc::new(Supplier::new("gen", cap(4), supply.clone(), move || {
            let n = source.fetch_add(1, Ordering::SeqCst);
            Ok((n < 20).then_some(n))
        }));
        let consumer = {
            let supply = supply.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(droplet) = supply.pop().await {
                    seen.push(droplet.value);
                }
                seen
            })
        };
        supplier.clone().run().await.unwrap();
        assert_eq!(supplier.state(), WorkerState::Done);
        assert!(supply.end_of_input());
        let seen = consumer.await.unwrap();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failing_get_cancels_the_supplier() {
        let supply: Arc<SupplyPipe<u32>> = SupplyPipe::new("failing", cap(2));
        let supplier = Arc::new(Supplier::new("gen", cap(1), supply.clone(), || {
            Err("source broke".into())
        }));
        let error = supplier.clone().run().await.unwrap_err();
        match error {
            Error::Task { message, .. } => assert!(message.contains("source broke")),
            other => panic!("expected Task, got {other:?}"),
        }
        assert_eq!(supplier.state(), WorkerState::Cancelled);
        // The output still reaches end-of-input so dependents can drain.
        assert!(supply.end_of_input());
    }
}
