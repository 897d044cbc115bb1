// SPDX-License-Identifier: Apache-2.0

//! The droplet envelope and index-scope identities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-scoped allocator for scope identities.
static NEXT_SCOPE: AtomicU64 = AtomicU64::new(0);

/// Identity of an index scope.
///
/// A scope is opened wherever drops are (re)introduced into the flow: at a
/// [`SupplyPipe`](crate::SupplyPipe). Every droplet carries the scope it was
/// indexed under; pipes use the scope to restore supply order across
/// concurrent pushers. Scope identities are unique for the lifetime of the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Allocates a fresh scope identity from the process-scoped counter.
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// A user value travelling through the pipeline, together with the
/// `(scope, index)` pair that pins its position within its supply order.
///
/// The value itself is opaque to the runtime; only the envelope is inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Droplet<T> {
    /// The index scope this droplet was introduced under.
    pub scope: ScopeId,
    /// The position assigned by the scope, starting at zero.
    pub index: u64,
    /// The user value.
    pub value: T,
}

impl<T> Droplet<T> {
    /// Creates a droplet pinned to `(scope, index)`.
    pub fn new(scope: ScopeId, index: u64, value: T) -> Self {
        Self {
            scope,
            index,
            value,
        }
    }

    /// Re-wraps `value` under this droplet's `(scope, index)`.
    ///
    /// Used by order-preserving workers: the output droplet keeps the input
    /// droplet's position so the downstream pipe can restore supply order.
    pub fn with_value<U>(&self, value: U) -> Droplet<U> {
        Droplet {
            scope: self.scope,
            index: self.index,
            value,
        }
    }

    /// Maps the carried value, keeping `(scope, index)`.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Droplet<U> {
        Droplet {
            scope: self.scope,
            index: self.index,
            value: f(self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_ids_are_unique() {
        let a = ScopeId::fresh();
        let b = ScopeId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn with_value_keeps_position() {
        let scope = ScopeId::fresh();
        let d = Droplet::new(scope, 7, 'x');
        let e = d.with_value("seven");
        assert_eq!(e.scope, scope);
        assert_eq!(e.index, 7);
        assert_eq!(e.value, "seven");
    }

    #[test]
    fn map_transforms_value_only() {
        let d = Droplet::new(ScopeId::fresh(), 3, 10_u32);
        let e = d.clone().map(|v| v * 2);
        assert_eq!(e.index, d.index);
        assert_eq!(e.scope, d.scope);
        assert_eq!(e.value, 20);
    }
}
