// SPDX-License-Identifier: Apache-2.0

//! The supply pipe: a pipe that originates an index scope.

use crate::droplet::{Droplet, ScopeId};
use crate::error::PushError;
use crate::monitor::PipeHandle;
use crate::pipe::Pipe;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A [`Pipe`] that additionally originates an index scope and optionally
/// filters pushes through a predicate.
///
/// Every value successfully pushed through a supply pipe is stamped with the
/// next index of the pipe's scope; downstream scope-preserving pipes restore
/// this order no matter how concurrent pushers interleave. A value rejected
/// by the predicate is silently discarded and consumes no index, so the
/// surviving drops still form a gap-free sequence.
///
/// Supply pipes accept pushes from arbitrarily many producers; the graph
/// validator reports such configurations as `MULTIPLE_INPUTS`. Note that
/// with several producers the end-of-input signal must be coordinated by the
/// caller (e.g. with a latch): a producer racing a close observes
/// [`PushError::Closed`].
pub struct SupplyPipe<T> {
    pipe: Arc<Pipe<T>>,
    scope: ScopeId,
    next_index: AtomicU64,
    predicate: Option<Predicate<T>>,
}

impl<T: Send + 'static> SupplyPipe<T> {
    /// Creates a supply pipe owning a fresh index scope.
    #[must_use]
    pub fn new(name: impl Into<String>, base_capacity: NonZeroUsize) -> Arc<Self> {
        Self::build(name, base_capacity, None)
    }

    /// Creates a supply pipe that only admits values satisfying `predicate`.
    #[must_use]
    pub fn with_predicate(
        name: impl Into<String>,
        base_capacity: NonZeroUsize,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(name, base_capacity, Some(Arc::new(predicate)))
    }

    fn build(
        name: impl Into<String>,
        base_capacity: NonZeroUsize,
        predicate: Option<Predicate<T>>,
    ) -> Arc<Self> {
        let pipe = Pipe::with_kind(name, base_capacity, true);
        let scope = ScopeId::fresh();
        pipe.register_scope(scope);
        Arc::new(Self {
            pipe,
            scope,
            next_index: AtomicU64::new(0),
            predicate,
        })
    }

    /// The index scope this pipe originates.
    #[must_use]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// A shared handle to the underlying pipe, for wiring consumers.
    #[must_use]
    pub fn pipe(&self) -> Arc<Pipe<T>> {
        self.pipe.clone()
    }

    /// Evaluates the predicate and, if the value is admitted, stamps it with
    /// the scope's next index.
    ///
    /// Returns `None` for a value rejected by the predicate; no index is
    /// consumed. The returned droplet must still be pushed with
    /// [`Pipe::push`] — suppliers use this split to serialize value
    /// acquisition with index assignment while letting the pushes themselves
    /// run concurrently.
    pub fn stamp(&self, value: T) -> Option<Droplet<T>> {
        if let Some(predicate) = &self.predicate {
            if !predicate(&value) {
                return None;
            }
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        Some(Droplet::new(self.scope, index, value))
    }

    /// Pushes a value, stamping it with the scope's next index.
    ///
    /// Resolves to `Ok(true)` once the drop is placed, `Ok(false)` if the
    /// predicate rejected it (no index consumed), and fails with
    /// [`PushError::Closed`] after end-of-input.
    pub async fn push(&self, value: T) -> Result<bool, PushError<T>> {
        match self.stamp(value) {
            Some(droplet) => {
                self.pipe.push(droplet).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<T: Send + 'static> Deref for SupplyPipe<T> {
    type Target = Pipe<T>;

    fn deref(&self) -> &Self::Target {
        &self.pipe
    }
}
