// SPDX-License-Identifier: Apache-2.0

//! Common properties shared by all worker shapes in the pipeline.
//!
//! Every worker, whatever its role, implements [`PipelineWorker`]; the
//! pipeline stores workers behind that trait and the chart/validator reads
//! their [`WorkerDescriptor`]s. Descriptors refer to pipes through
//! [`PipePort`]s, which carry the pipe's static description plus a
//! type-erased wiring handle, so the graph analysis never touches the
//! droplet types and no owning back-references exist between workers and
//! pipes.

use crate::error::Error;
use crate::retry::RetryPolicy;
use crate::worker::{CancelCause, WorkerState};
use dropflow_pipe::{Pipe, PipeHandle, PipeInfo, PipeMonitoring, ScopeId};
use std::fmt;
use std::sync::Arc;

/// The role shapes a worker can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Originates drops into a supply pipe.
    Supplier,
    /// Maps each drop one-to-one, preserving `(scope, index)`.
    Function,
    /// Maps each drop to any number of drops in a new scope.
    Transformer,
    /// Runs a side effect and forwards the drop to an optional output.
    Action,
    /// Runs a side effect; no output.
    Consumer,
    /// Fans every drop out to each of its outputs, preserving the scope.
    Fork,
    /// Fans several inputs into one output supply pipe (a scope boundary).
    Join,
}

impl RoleKind {
    /// Whether outputs of this role carry the scopes of its inputs.
    pub(crate) fn preserves_scope(self) -> bool {
        matches!(self, Self::Function | Self::Action | Self::Fork)
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Supplier => "supplier",
            Self::Function => "function",
            Self::Transformer => "transformer",
            Self::Action => "action",
            Self::Consumer => "consumer",
            Self::Fork => "fork",
            Self::Join => "join",
        };
        write!(f, "{label}")
    }
}

/// A wiring port of a worker: a pipe's static description together with its
/// type-erased handle.
#[derive(Clone)]
pub struct PipePort {
    info: PipeInfo,
    handle: Arc<dyn PipeHandle>,
}

impl PipePort {
    /// Captures `pipe` as a port.
    #[must_use]
    pub fn of<T: Send + 'static>(pipe: &Arc<Pipe<T>>) -> Self {
        Self {
            info: pipe.info(),
            handle: pipe.clone(),
        }
    }

    /// The pipe's static description.
    #[must_use]
    pub fn info(&self) -> &PipeInfo {
        &self.info
    }

    /// The pipe's monitoring view.
    #[must_use]
    pub fn monitoring(&self) -> &dyn PipeMonitoring {
        self.handle.as_ref()
    }

    pub(crate) fn register_scope(&self, scope: ScopeId) {
        self.handle.register_scope(scope);
    }

    pub(crate) fn registered_scopes(&self) -> Vec<ScopeId> {
        self.handle.registered_scopes()
    }
}

impl fmt::Debug for PipePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PipePort").field(&self.info).finish()
    }
}

/// Static, type-erased description of a worker, consumed by the
/// chart/validator.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    /// The worker's name.
    pub name: String,
    /// The worker's role shape.
    pub kind: RoleKind,
    /// Whether the worker is runtime-internal (exempt from discovery).
    pub internal: bool,
    /// The pipes the worker reads from.
    pub inputs: Vec<PipePort>,
    /// The pipes the worker writes to.
    pub outputs: Vec<PipePort>,
}

/// Read-only monitoring view over a worker.
///
/// Values are sampled from atomics and the worker's state channel without
/// taking the worker's locks; they may be approximate, but the state only
/// progresses forward.
pub trait WorkerMonitoring: Send + Sync {
    /// The worker's lifecycle state.
    fn state(&self) -> WorkerState;

    /// The worker's parallelism bound.
    fn concurrency(&self) -> usize;

    /// Number of tasks that terminated abnormally after submission.
    fn cancelled_work(&self) -> u64;

    /// Fraction of task slots currently busy.
    fn current_utilization(&self) -> f64;

    /// Time-weighted average utilization over the worker's run.
    fn average_utilization(&self) -> f64;
}

/// Common trait for the workers of a pipeline.
#[async_trait::async_trait]
pub trait PipelineWorker: WorkerMonitoring {
    /// The worker's name.
    fn name(&self) -> &str;

    /// The worker's static description for graph analysis.
    fn descriptor(&self) -> WorkerDescriptor;

    /// Runs the worker to completion. Single-shot; a second call fails with
    /// [`Error::Reused`].
    async fn run(self: Arc<Self>) -> Result<(), Error>;

    /// Requests cancellation; see [`CancelCause`] for the semantics of each
    /// cause. Idempotent: the first recorded failure wins.
    fn cancel(&self, cause: CancelCause);

    /// Waits until the worker reaches a terminal state. Never returns the
    /// worker's error; use [`failure`](PipelineWorker::failure) for
    /// diagnostics.
    async fn join(&self);

    /// Attaches a retry policy. Fails with [`Error::AlreadyStarted`] once
    /// the worker runs.
    fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), Error>;

    /// The worker's primary error, if it failed.
    fn failure(&self) -> Option<Error>;
}
