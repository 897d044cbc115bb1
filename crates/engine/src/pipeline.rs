// SPDX-License-Identifier: Apache-2.0

//! The pipeline: builder and root runner.
//!
//! A pipeline owns its workers. Building validates the assembled graph
//! through the [`Chart`]: a cycle or a duplicate scope producer is fatal,
//! everything else surfaces as observable warnings. Running spawns every
//! worker on the executor, supervises completion, aggregates failures
//! first-error-wins, and guarantees that every worker reaches a terminal
//! state before control returns.

use crate::chart::{Chart, Warning};
use crate::error::{Error, ErrorSlot, TaskError};
use crate::node::{PipePort, PipelineWorker, RoleKind, WorkerDescriptor};
use crate::roles::Supplier;
use crate::worker::{CancelCause, Role, Worker};
use dropflow_pipe::{PipeId, SupplyPipe};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Builder for a [`Pipeline`].
///
/// Obtained from [`Pipeline::from`] (supplier entry) or
/// [`Pipeline::from_supply_pipe`] (externally fed entry); further workers
/// are registered with [`through`](PipelineBuilder::through). Wiring is
/// carried by the workers themselves — each role was constructed with its
/// pipes — so registration order is free.
pub struct PipelineBuilder {
    root: PipePort,
    workers: Vec<Arc<dyn PipelineWorker>>,
}

impl PipelineBuilder {
    /// Registers a worker.
    #[must_use]
    pub fn through<R: Role>(mut self, worker: Worker<R>) -> Self {
        self.workers.push(Arc::new(worker));
        self
    }

    /// Validates the graph and assembles the pipeline.
    ///
    /// Fails with [`Error::Configuration`] on a cyclic graph, a fork or
    /// join with too few branches, several workers producing into the same
    /// scope-preserving pipe, or duplicate worker names. Non-fatal
    /// observations are available through [`Pipeline::warnings`].
    pub fn build(self) -> Result<Pipeline, Error> {
        let descriptors: Vec<WorkerDescriptor> =
            self.workers.iter().map(|w| w.descriptor()).collect();

        let mut seen_names = BTreeSet::new();
        for descriptor in &descriptors {
            if !seen_names.insert(descriptor.name.clone()) {
                return Err(Error::Configuration {
                    message: format!("duplicate worker name `{}`", descriptor.name),
                });
            }
            match descriptor.kind {
                RoleKind::Fork if descriptor.outputs.len() < 2 => {
                    return Err(Error::Configuration {
                        message: format!(
                            "fork `{}` needs at least two outputs",
                            descriptor.name
                        ),
                    });
                }
                RoleKind::Join if descriptor.inputs.len() < 2 => {
                    return Err(Error::Configuration {
                        message: format!("join `{}` needs at least two inputs", descriptor.name),
                    });
                }
                _ => {}
            }
        }

        // Several producers may share a supply pipe (the graph reports
        // MULTIPLE_INPUTS); sharing a scope-preserving pipe is a
        // configuration error.
        let mut producers: HashMap<PipeId, usize> = HashMap::new();
        for descriptor in &descriptors {
            for port in &descriptor.outputs {
                *producers.entry(port.info().id).or_insert(0) += 1;
                if producers[&port.info().id] > 1 && !port.info().supply {
                    return Err(Error::Configuration {
                        message: format!(
                            "pipe `{}` has more than one producing worker",
                            port.info().name
                        ),
                    });
                }
            }
        }

        let chart = Chart::build(&descriptors, self.root.info());
        if chart.warnings().contains(&Warning::Cycle) {
            return Err(Error::Configuration {
                message: "cycle detected in the pipeline graph".into(),
            });
        }
        if !chart.warnings().is_empty() {
            tracing::warn!(
                warnings = ?chart.warnings(),
                "pipeline built with structural warnings"
            );
        }

        // Propagate index scopes downstream: an order-preserving worker's
        // outputs accept the scopes of its inputs. Iterated to a fixpoint
        // so chains settle regardless of registration order.
        let mut changed = true;
        let mut rounds = 0;
        while changed && rounds <= descriptors.len() {
            changed = false;
            rounds += 1;
            for descriptor in &descriptors {
                if !descriptor.kind.preserves_scope() {
                    continue;
                }
                let scopes: Vec<_> = descriptor
                    .inputs
                    .iter()
                    .flat_map(PipePort::registered_scopes)
                    .collect();
                for output in &descriptor.outputs {
                    let existing = output.registered_scopes();
                    for &scope in &scopes {
                        if !existing.contains(&scope) {
                            output.register_scope(scope);
                            changed = true;
                        }
                    }
                }
            }
        }

        let mut pipes: BTreeMap<PipeId, PipePort> = BTreeMap::new();
        let _ = pipes.insert(self.root.info().id, self.root.clone());
        for descriptor in &descriptors {
            for port in descriptor.inputs.iter().chain(&descriptor.outputs) {
                let _ = pipes.entry(port.info().id).or_insert_with(|| port.clone());
            }
        }

        let (done, _) = watch::channel(false);
        Ok(Pipeline {
            workers: self.workers,
            pipes: pipes.into_values().collect(),
            chart,
            started: AtomicBool::new(false),
            errors: ErrorSlot::default(),
            done,
        })
    }
}

/// A built pipeline: the root object owning the workers, the computed chart,
/// and the run/cancel lifecycle.
pub struct Pipeline {
    workers: Vec<Arc<dyn PipelineWorker>>,
    pipes: Vec<PipePort>,
    chart: Chart,
    started: AtomicBool,
    errors: ErrorSlot,
    done: watch::Sender<bool>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Starts a pipeline fed by a supplier worker; the supplier's output
    /// supply pipe is the root of the graph.
    #[must_use]
    pub fn from<O: Send + 'static>(supplier: Worker<Supplier<O>>) -> PipelineBuilder {
        let root = supplier.role().output_port();
        PipelineBuilder {
            root,
            workers: vec![Arc::new(supplier)],
        }
    }

    /// Starts a pipeline fed externally through `supply`: the caller pushes
    /// values and signals end-of-input on the pipe itself.
    #[must_use]
    pub fn from_supply_pipe<T: Send + 'static>(supply: &Arc<SupplyPipe<T>>) -> PipelineBuilder {
        PipelineBuilder {
            root: PipePort::of(&supply.pipe()),
            workers: Vec::new(),
        }
    }

    /// Runs every worker to termination. Single-shot.
    ///
    /// Returns the first failure observed across the workers (later ones
    /// are recorded as suppressed). On a failure the remaining workers are
    /// cancelled quietly, so the call always returns with every worker in a
    /// terminal state and every task pool shut down.
    pub async fn run(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::PipelineReused);
        }
        tracing::debug!(workers = self.workers.len(), "pipeline running");
        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            let _ = tasks.spawn(async move { worker.run().await });
        }
        let mut failed = self.errors.has_primary();
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => Err(Error::Task {
                    worker: "pipeline".into(),
                    message: format!("worker task failed: {join_error}"),
                }),
            };
            if let Err(error) = result {
                let newly_primary = self.errors.record(error);
                if newly_primary {
                    tracing::warn!("pipeline observed its first failure");
                }
                if !failed {
                    failed = true;
                    self.silence_workers();
                }
            }
        }
        let _ = self.done.send_replace(true);
        let (primary, suppressed) = self.errors.snapshot();
        if !suppressed.is_empty() {
            tracing::debug!(suppressed = suppressed.len(), "pipeline suppressed errors");
        }
        match primary {
            Some(error) => Err(error),
            None => {
                tracing::debug!("pipeline finished");
                Ok(())
            }
        }
    }

    /// Cancels the pipeline with a caller-supplied error: the error becomes
    /// the pipeline's failure and every worker is cancelled.
    pub fn cancel(&self, error: TaskError) {
        let _ = self.errors.record(Error::Cancelled {
            message: error.to_string(),
        });
        self.silence_workers();
    }

    /// Stops the pipeline quietly: every worker is cancelled without
    /// surfacing an error, and `run` returns `Ok`.
    pub fn stop(&self) {
        tracing::debug!("pipeline stop requested");
        self.silence_workers();
    }

    /// Waits until `run` has returned. Never returns the pipeline's error;
    /// use [`failure`](Pipeline::failure) for diagnostics.
    pub async fn join(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// The structural warnings observed at build time.
    #[must_use]
    pub fn warnings(&self) -> &BTreeSet<Warning> {
        self.chart.warnings()
    }

    /// The computed chart.
    #[must_use]
    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    /// The pipeline's workers, for monitoring.
    #[must_use]
    pub fn workers(&self) -> &[Arc<dyn PipelineWorker>] {
        &self.workers
    }

    /// The pipeline's pipes, for monitoring.
    #[must_use]
    pub fn pipes(&self) -> &[PipePort] {
        &self.pipes
    }

    /// The pipeline's primary failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<Error> {
        self.errors.snapshot().0
    }

    /// Failures recorded after the primary one.
    #[must_use]
    pub fn suppressed_failures(&self) -> Vec<Error> {
        self.errors.snapshot().1
    }

    fn silence_workers(&self) {
        for worker in &self.workers {
            worker.cancel(CancelCause::Silent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{Consumer, Fork, Function, Join};
    use dropflow_pipe::Pipe;
    use std::num::NonZeroUsize;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn noop_supplier(name: &str, supply: &Arc<SupplyPipe<u32>>) -> Worker<Supplier<u32>> {
        Supplier::new(name, cap(1), supply.clone(), || Ok(None))
    }

    #[test]
    fn linear_build_has_no_warnings() {
        let supply = SupplyPipe::new("nums", cap(4));
        let pipeline = Pipeline::from(noop_supplier("gen", &supply))
            .through(Consumer::new("sink", cap(1), supply.pipe(), |_: &u32| Ok(())))
            .build()
            .unwrap();
        assert!(pipeline.warnings().is_empty());
        assert_eq!(pipeline.workers().len(), 2);
    }

    #[test]
    fn fork_with_one_output_is_rejected() {
        let supply = SupplyPipe::new("nums", cap(4));
        let only: Arc<Pipe<u32>> = Pipe::new("only", cap(4));
        let result = Pipeline::from(noop_supplier("gen", &supply))
            .through(Fork::new("split", cap(1), supply.pipe(), vec![only]))
            .build();
        match result {
            Err(Error::Configuration { message }) => {
                assert!(message.contains("at least two outputs"), "{message}");
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[test]
    fn join_with_one_input_is_rejected() {
        let supply = SupplyPipe::new("nums", cap(4));
        let merged = SupplyPipe::new("merged", cap(4));
        let result = Pipeline::from(noop_supplier("gen", &supply))
            .through(Join::new("merge", vec![supply.pipe()], merged))
            .build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn two_producers_into_a_plain_pipe_are_rejected() {
        let supply = SupplyPipe::new("nums", cap(4));
        let shared: Arc<Pipe<u32>> = Pipe::new("shared", cap(4));
        let result = Pipeline::from(noop_supplier("gen", &supply))
            .through(Function::new(
                "double",
                cap(1),
                supply.pipe(),
                shared.clone(),
                |n: &u32| Ok(n * 2),
            ))
            .through(Function::new(
                "triple",
                cap(1),
                supply.pipe(),
                shared.clone(),
                |n: &u32| Ok(n * 3),
            ))
            .through(Consumer::new("sink", cap(1), shared.clone(), |_: &u32| {
                Ok(())
            }))
            .build();
        match result {
            Err(Error::Configuration { message }) => {
                assert!(message.contains("more than one producing worker"), "{message}");
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[test]
    fn cyclic_graph_is_fatal() {
        let supply = SupplyPipe::new("nums", cap(4));
        let loopback: Arc<Pipe<u32>> = Pipe::new("loop", cap(4));
        let result = Pipeline::from(noop_supplier("gen", &supply))
            .through(Function::new(
                "spin",
                cap(1),
                loopback.clone(),
                loopback.clone(),
                |n: &u32| Ok(*n),
            ))
            .build();
        match result {
            Err(Error::Configuration { message }) => {
                assert!(message.contains("cycle"), "{message}");
            }
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_worker_names_are_rejected() {
        let supply = SupplyPipe::new("nums", cap(4));
        let result = Pipeline::from(noop_supplier("twin", &supply))
            .through(Consumer::new("twin", cap(1), supply.pipe(), |_: &u32| Ok(())))
            .build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn scopes_propagate_through_preserving_workers() {
        use dropflow_pipe::PipeHandle;

        let supply = SupplyPipe::new("nums", cap(4));
        let mapped: Arc<Pipe<u32>> = Pipe::new("mapped", cap(4));
        let _pipeline = Pipeline::from(noop_supplier("gen", &supply))
            .through(Function::new(
                "id",
                cap(1),
                supply.pipe(),
                mapped.clone(),
                |n: &u32| Ok(*n),
            ))
            .through(Consumer::new("sink", cap(1), mapped.clone(), |_: &u32| {
                Ok(())
            }))
            .build()
            .unwrap();
        assert!(mapped.registered_scopes().contains(&supply.scope()));
    }

    #[tokio::test]
    async fn run_is_single_shot() {
        let supply = SupplyPipe::new("nums", cap(4));
        let pipeline = Pipeline::from(noop_supplier("gen", &supply))
            .through(Consumer::new("sink", cap(1), supply.pipe(), |_: &u32| Ok(())))
            .build()
            .unwrap();
        pipeline.run().await.unwrap();
        assert!(matches!(
            pipeline.run().await,
            Err(Error::PipelineReused)
        ));
    }
}
