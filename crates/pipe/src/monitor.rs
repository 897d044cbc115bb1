// SPDX-License-Identifier: Apache-2.0

//! Read-only observability views over pipes.
//!
//! Monitoring values are sampled from atomics mirrored outside the pipe lock,
//! so sampling never contends with producers or consumers. Values may be
//! momentarily inconsistent with each other, but `drops_pushed` and
//! `end_of_input` only ever move forward.

use crate::droplet::ScopeId;
use crate::pipe::PipeId;

/// Static description of a pipe, used by the graph validator and the chart.
///
/// Carrying ids instead of references keeps the assembled graph free of
/// owning back-references between pipes and workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeInfo {
    /// Process-unique identity of the pipe.
    pub id: PipeId,
    /// Human-readable pipe name.
    pub name: String,
    /// Static size of the in-order queue and of the out-of-order cache.
    pub base_capacity: usize,
    /// Whether the pipe originates an index scope.
    pub supply: bool,
}

/// Read-only monitoring view over a pipe.
pub trait PipeMonitoring: Send + Sync {
    /// The pipe name.
    fn name(&self) -> &str;

    /// Static size of the in-order queue and of the out-of-order cache.
    fn base_capacity(&self) -> usize;

    /// Number of drops currently waiting in the in-order queue.
    fn in_order_drops(&self) -> usize;

    /// Number of drops currently parked in the out-of-order cache.
    fn out_of_order_drops(&self) -> usize;

    /// Number of drops admitted to `push` but not yet enqueued.
    fn in_push_drops(&self) -> usize;

    /// Total number of drops accepted by the pipe so far.
    fn drops_pushed(&self) -> u64;

    /// Whether end-of-input has been signaled.
    fn end_of_input(&self) -> bool;

    /// Current occupancy as a fraction of the base capacity.
    fn current_load(&self) -> f64;

    /// Time-weighted average of [`current_load`](PipeMonitoring::current_load)
    /// since the pipe was created.
    fn average_load(&self) -> f64;
}

/// Type-erased wiring handle over a pipe.
///
/// The pipeline builder works with `Arc<dyn PipeHandle>` so graph analysis
/// and scope propagation do not depend on the droplet type.
pub trait PipeHandle: PipeMonitoring {
    /// Static description of the pipe.
    fn info(&self) -> PipeInfo;

    /// Registers `scope` as accepted by this pipe.
    ///
    /// Wiring-time operation: the pipeline builder propagates the scopes of a
    /// worker's input pipes onto its order-preserving output pipes. A push
    /// whose scope was never registered fails with
    /// [`PushError::ScopeMismatch`](crate::PushError::ScopeMismatch).
    fn register_scope(&self, scope: ScopeId);

    /// The scopes currently registered on this pipe.
    fn registered_scopes(&self) -> Vec<ScopeId>;
}
