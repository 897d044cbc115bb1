// SPDX-License-Identifier: Apache-2.0

//! The bounded, scope-ordered pipe.
//!
//! A pipe keeps two internal stores of at most `base_capacity` drops each:
//! the in-order queue, holding drops ready for consumers, and the
//! out-of-order cache, holding drops whose scope predecessors have not
//! arrived yet. Concurrent producers may complete their pushes in any
//! real-time order; a drop only moves to the in-order queue once its index
//! equals the scope's next expected index, so consumers always observe a
//! contiguous index sequence per scope.
//!
//! Backpressure: once a store is full the corresponding pushes suspend. The
//! total number of visible drops is bounded by `2 * base_capacity` plus the
//! number of in-flight pushers ("in-push" drops, admitted but not enqueued).

use crate::droplet::{Droplet, ScopeId};
use crate::error::PushError;
use crate::meter::Meter;
use crate::monitor::{PipeHandle, PipeInfo, PipeMonitoring};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

/// Process-scoped allocator for pipe identities.
static NEXT_PIPE: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a pipe.
///
/// The graph validator refers to pipes by id, never by reference, which
/// keeps the assembled graph free of ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Bounded FIFO queue of droplets with per-scope order restoration,
/// end-of-input signaling, and multi-producer/multi-consumer semantics.
///
/// Pipes are created behind an [`Arc`] and shared between the producing and
/// consuming workers; every operation takes `&self`.
pub struct Pipe<T> {
    id: PipeId,
    name: String,
    base_capacity: NonZeroUsize,
    supply: bool,
    state: Mutex<PipeState<T>>,
    stats: PipeStats,
}

/// Per-scope ordering state: the next index consumers are owed, and the
/// drops that arrived ahead of it.
struct ScopeState<T> {
    next_expected: u64,
    pending: BTreeMap<u64, T>,
}

struct PipeState<T> {
    in_order: VecDeque<Droplet<T>>,
    scopes: HashMap<ScopeId, ScopeState<T>>,
    /// Total drops across all scopes' pending maps.
    out_of_order: usize,
    /// Pushes admitted but not yet enqueued.
    in_push: usize,
    end_of_input: bool,
    push_wakers: Vec<Waker>,
    pop_wakers: Vec<Waker>,
}

/// Lock-free mirrors of the queue counters, for monitoring.
struct PipeStats {
    in_order: AtomicUsize,
    out_of_order: AtomicUsize,
    in_push: AtomicUsize,
    drops_pushed: AtomicU64,
    end_of_input: AtomicBool,
    load: Meter,
}

impl<T> PipeState<T> {
    /// Moves contiguous out-of-order successors into the in-order queue,
    /// advancing each scope's next expected index, while the in-order queue
    /// has room. Returns the number of drops moved.
    fn drain_ready(&mut self, capacity: usize) -> usize {
        let mut moved = 0;
        for (&scope, ss) in &mut self.scopes {
            while self.in_order.len() < capacity {
                let ready = ss
                    .pending
                    .first_key_value()
                    .is_some_and(|(&index, _)| index == ss.next_expected);
                if !ready {
                    break;
                }
                if let Some((index, value)) = ss.pending.pop_first() {
                    self.in_order.push_back(Droplet::new(scope, index, value));
                    ss.next_expected += 1;
                    self.out_of_order -= 1;
                    moved += 1;
                }
            }
        }
        moved
    }
}

/// Stores `waker` unless an equivalent waker is already parked.
fn register_waker(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|parked| parked.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

impl<T> Pipe<T> {
    /// Creates a scope-preserving pipe.
    ///
    /// The pipe accepts pushes only for scopes registered on it (see
    /// [`PipeHandle::register_scope`]); the pipeline builder does this while
    /// wiring the graph.
    #[must_use]
    pub fn new(name: impl Into<String>, base_capacity: NonZeroUsize) -> Arc<Self> {
        Self::with_kind(name, base_capacity, false)
    }

    pub(crate) fn with_kind(
        name: impl Into<String>,
        base_capacity: NonZeroUsize,
        supply: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: PipeId(NEXT_PIPE.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            base_capacity,
            supply,
            state: Mutex::new(PipeState {
                in_order: VecDeque::with_capacity(base_capacity.get()),
                scopes: HashMap::new(),
                out_of_order: 0,
                in_push: 0,
                end_of_input: false,
                push_wakers: Vec::new(),
                pop_wakers: Vec::new(),
            }),
            stats: PipeStats {
                in_order: AtomicUsize::new(0),
                out_of_order: AtomicUsize::new(0),
                in_push: AtomicUsize::new(0),
                drops_pushed: AtomicU64::new(0),
                end_of_input: AtomicBool::new(false),
                load: Meter::new(),
            },
        })
    }

    /// The pipe's process-unique identity.
    #[must_use]
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Pushes a droplet, suspending while the pipe is full.
    ///
    /// The push completes once the droplet is placed in the in-order queue
    /// or parked in the out-of-order cache. It fails with
    /// [`PushError::Closed`] once end-of-input was signaled, and with
    /// [`PushError::ScopeMismatch`] if the droplet's scope was never
    /// registered on this pipe.
    pub fn push(&self, droplet: Droplet<T>) -> PushFuture<'_, T> {
        PushFuture {
            pipe: self,
            droplet: Some(droplet),
            admitted: false,
        }
    }

    /// Pops the next in-order droplet, suspending while none is available.
    ///
    /// Resolves to `None` (the "closed" sentinel) once end-of-input was
    /// signaled, no pushes are in flight, and nothing is left to drain.
    pub fn pop(&self) -> PopFuture<'_, T> {
        PopFuture { pipe: self }
    }

    /// Signals that no further drops will be pushed.
    ///
    /// Idempotent. Wakes all suspended producers (their pushes fail with
    /// [`PushError::Closed`]) and consumers (they drain what is left, then
    /// observe the closed sentinel).
    pub fn set_end_of_input(&self) {
        let mut to_wake = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.end_of_input {
                state.end_of_input = true;
                self.stats.end_of_input.store(true, Ordering::Release);
                tracing::debug!(pipe = %self.name, "end of input signaled");
            }
            to_wake.append(&mut state.push_wakers);
            to_wake.append(&mut state.pop_wakers);
        }
        for waker in to_wake {
            waker.wake();
        }
    }

    fn sync_stats(&self, state: &PipeState<T>) {
        self.stats.in_order.store(state.in_order.len(), Ordering::Relaxed);
        self.stats
            .out_of_order
            .store(state.out_of_order, Ordering::Relaxed);
        self.stats.in_push.store(state.in_push, Ordering::Relaxed);
        let occupancy = state.in_order.len() + state.out_of_order;
        self.stats
            .load
            .set(occupancy as f64 / self.base_capacity.get() as f64);
    }
}

impl<T: Send + 'static> PipeMonitoring for Pipe<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_capacity(&self) -> usize {
        self.base_capacity.get()
    }

    fn in_order_drops(&self) -> usize {
        self.stats.in_order.load(Ordering::Relaxed)
    }

    fn out_of_order_drops(&self) -> usize {
        self.stats.out_of_order.load(Ordering::Relaxed)
    }

    fn in_push_drops(&self) -> usize {
        self.stats.in_push.load(Ordering::Relaxed)
    }

    fn drops_pushed(&self) -> u64 {
        self.stats.drops_pushed.load(Ordering::Relaxed)
    }

    fn end_of_input(&self) -> bool {
        self.stats.end_of_input.load(Ordering::Acquire)
    }

    fn current_load(&self) -> f64 {
        self.stats.load.current()
    }

    fn average_load(&self) -> f64 {
        self.stats.load.average()
    }
}

impl<T: Send + 'static> PipeHandle for Pipe<T> {
    fn info(&self) -> PipeInfo {
        PipeInfo {
            id: self.id,
            name: self.name.clone(),
            base_capacity: self.base_capacity.get(),
            supply: self.supply,
        }
    }

    fn register_scope(&self, scope: ScopeId) {
        let mut state = self.state.lock();
        let _ = state.scopes.entry(scope).or_insert_with(|| ScopeState {
            next_expected: 0,
            pending: BTreeMap::new(),
        });
    }

    fn registered_scopes(&self) -> Vec<ScopeId> {
        self.state.lock().scopes.keys().copied().collect()
    }
}

/// Future returned by [`Pipe::push`].
pub struct PushFuture<'a, T> {
    pipe: &'a Pipe<T>,
    droplet: Option<Droplet<T>>,
    /// Whether this push is counted in the pipe's in-push counter.
    admitted: bool,
}

impl<T> Unpin for PushFuture<'_, T> {}

impl<T> Future for PushFuture<'_, T> {
    type Output = Result<(), PushError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let droplet = this
            .droplet
            .take()
            .expect("PushFuture polled after completion");
        let mut to_wake = Vec::new();
        let result = {
            let mut state = this.pipe.state.lock();
            if !this.admitted {
                this.admitted = true;
                state.in_push += 1;
            }
            if state.end_of_input {
                this.admitted = false;
                state.in_push -= 1;
                // Consumers waiting to observe the closed sentinel re-check
                // the in-push count.
                to_wake.append(&mut state.pop_wakers);
                this.pipe.sync_stats(&state);
                Poll::Ready(Err(PushError::Closed(droplet)))
            } else if !state.scopes.contains_key(&droplet.scope) {
                this.admitted = false;
                state.in_push -= 1;
                to_wake.append(&mut state.pop_wakers);
                this.pipe.sync_stats(&state);
                Poll::Ready(Err(PushError::ScopeMismatch(droplet)))
            } else {
                let capacity = this.pipe.base_capacity.get();
                let next_expected = state.scopes[&droplet.scope].next_expected;
                if droplet.index == next_expected {
                    if state.in_order.len() < capacity {
                        let scope = droplet.scope;
                        state.in_order.push_back(droplet);
                        if let Some(ss) = state.scopes.get_mut(&scope) {
                            ss.next_expected += 1;
                        }
                        let _ = state.drain_ready(capacity);
                        this.admitted = false;
                        state.in_push -= 1;
                        let _ = this.pipe.stats.drops_pushed.fetch_add(1, Ordering::Relaxed);
                        to_wake.append(&mut state.pop_wakers);
                        // Draining the cache may have freed out-of-order slots.
                        to_wake.append(&mut state.push_wakers);
                        this.pipe.sync_stats(&state);
                        Poll::Ready(Ok(()))
                    } else {
                        register_waker(&mut state.push_wakers, cx.waker());
                        this.droplet = Some(droplet);
                        Poll::Pending
                    }
                } else if droplet.index > next_expected {
                    if state.out_of_order < capacity {
                        let Droplet {
                            scope,
                            index,
                            value,
                        } = droplet;
                        if let Some(ss) = state.scopes.get_mut(&scope) {
                            let _ = ss.pending.insert(index, value);
                        }
                        state.out_of_order += 1;
                        this.admitted = false;
                        state.in_push -= 1;
                        let _ = this.pipe.stats.drops_pushed.fetch_add(1, Ordering::Relaxed);
                        to_wake.append(&mut state.pop_wakers);
                        this.pipe.sync_stats(&state);
                        Poll::Ready(Ok(()))
                    } else {
                        register_waker(&mut state.push_wakers, cx.waker());
                        this.droplet = Some(droplet);
                        Poll::Pending
                    }
                } else {
                    // The scope already advanced past this index; the drop
                    // was delivered before. Nothing to place.
                    this.admitted = false;
                    state.in_push -= 1;
                    this.pipe.sync_stats(&state);
                    Poll::Ready(Ok(()))
                }
            }
        };
        for waker in to_wake {
            waker.wake();
        }
        result
    }
}

impl<T> Drop for PushFuture<'_, T> {
    fn drop(&mut self) {
        // A push abandoned mid-suspension (e.g. a `select!` taking another
        // branch) must release its in-push admission, or consumers waiting
        // on the closed sentinel would wait forever.
        if !self.admitted {
            return;
        }
        let mut to_wake = Vec::new();
        {
            let mut state = self.pipe.state.lock();
            state.in_push -= 1;
            to_wake.append(&mut state.pop_wakers);
            self.pipe.sync_stats(&state);
        }
        for waker in to_wake {
            waker.wake();
        }
    }
}

/// Future returned by [`Pipe::pop`].
pub struct PopFuture<'a, T> {
    pipe: &'a Pipe<T>,
}

impl<T> Unpin for PopFuture<'_, T> {}

impl<T> Future for PopFuture<'_, T> {
    type Output = Option<Droplet<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut to_wake = Vec::new();
        let result = {
            let mut state = self.pipe.state.lock();
            let capacity = self.pipe.base_capacity.get();
            if state.in_order.is_empty() && state.end_of_input && state.in_push == 0 {
                // Pending correct-ordered drops are still drained after close.
                let _ = state.drain_ready(capacity);
            }
            match state.in_order.pop_front() {
                Some(droplet) => {
                    let _ = state.drain_ready(capacity);
                    to_wake.append(&mut state.push_wakers);
                    if !state.in_order.is_empty() {
                        to_wake.append(&mut state.pop_wakers);
                    }
                    self.pipe.sync_stats(&state);
                    Poll::Ready(Some(droplet))
                }
                None if state.end_of_input && state.in_push == 0 => {
                    // Closed: let every other waiting consumer observe it.
                    to_wake.append(&mut state.pop_wakers);
                    Poll::Ready(None)
                }
                None => {
                    register_waker(&mut state.pop_wakers, cx.waker());
                    Poll::Pending
                }
            }
        };
        for waker in to_wake {
            waker.wake();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn pipe_with_scope(name: &str, capacity: usize) -> (Arc<Pipe<u32>>, ScopeId) {
        let pipe = Pipe::new(name, cap(capacity));
        let scope = ScopeId::fresh();
        pipe.register_scope(scope);
        (pipe, scope)
    }

    #[tokio::test]
    async fn in_order_pushes_pop_fifo() {
        let (pipe, scope) = pipe_with_scope("fifo", 4);
        for i in 0..4 {
            pipe.push(Droplet::new(scope, i, i as u32)).await.unwrap();
        }
        for i in 0..4 {
            let d = pipe.pop().await.unwrap();
            assert_eq!(d.index, i);
            assert_eq!(d.value, i as u32);
        }
    }

    #[tokio::test]
    async fn out_of_order_pushes_are_restored() {
        let (pipe, scope) = pipe_with_scope("restore", 4);
        // Arrive as 2, 0, 3, 1; must pop as 0, 1, 2, 3.
        pipe.push(Droplet::new(scope, 2, 2)).await.unwrap();
        pipe.push(Droplet::new(scope, 0, 0)).await.unwrap();
        pipe.push(Droplet::new(scope, 3, 3)).await.unwrap();
        pipe.push(Droplet::new(scope, 1, 1)).await.unwrap();
        for i in 0..4 {
            assert_eq!(pipe.pop().await.unwrap().index, i);
        }
    }

    #[tokio::test]
    async fn ahead_of_order_drop_waits_in_cache() {
        let (pipe, scope) = pipe_with_scope("cache", 4);
        pipe.push(Droplet::new(scope, 1, 1)).await.unwrap();
        assert_eq!(pipe.in_order_drops(), 0);
        assert_eq!(pipe.out_of_order_drops(), 1);
        // No in-order drop yet: pop must suspend.
        assert!(
            timeout(Duration::from_millis(50), pipe.pop()).await.is_err(),
            "pop should suspend until index 0 arrives"
        );
        pipe.push(Droplet::new(scope, 0, 0)).await.unwrap();
        assert_eq!(pipe.pop().await.unwrap().index, 0);
        assert_eq!(pipe.pop().await.unwrap().index, 1);
    }

    #[tokio::test]
    async fn backpressure_suspends_push_until_pop() {
        let (pipe, scope) = pipe_with_scope("full", 2);
        pipe.push(Droplet::new(scope, 0, 0)).await.unwrap();
        pipe.push(Droplet::new(scope, 1, 1)).await.unwrap();
        // In-order queue is full; the next in-order push must suspend.
        let blocked = pipe.push(Droplet::new(scope, 2, 2));
        futures::pin_mut!(blocked);
        assert!(
            timeout(Duration::from_millis(50), &mut blocked).await.is_err(),
            "push should suspend while the pipe is full"
        );
        assert_eq!(pipe.pop().await.unwrap().index, 0);
        timeout(Duration::from_millis(200), blocked)
            .await
            .expect("push should resume after a pop")
            .unwrap();
        assert_eq!(pipe.pop().await.unwrap().index, 1);
        assert_eq!(pipe.pop().await.unwrap().index, 2);
    }

    #[tokio::test]
    async fn visible_drops_never_exceed_twice_base_capacity() {
        let (pipe, scope) = pipe_with_scope("bound", 2);
        // Fill the in-order queue (0, 1) and the out-of-order cache (3, 4).
        for (index, value) in [(0, 0), (1, 1), (3, 3), (4, 4)] {
            pipe.push(Droplet::new(scope, index, value)).await.unwrap();
        }
        assert_eq!(pipe.in_order_drops() + pipe.out_of_order_drops(), 4);
        // Cache is full: another ahead-of-order push suspends.
        let blocked = pipe.push(Droplet::new(scope, 5, 5));
        futures::pin_mut!(blocked);
        assert!(timeout(Duration::from_millis(50), &mut blocked).await.is_err());
        assert!(pipe.in_order_drops() <= 2);
        assert!(pipe.in_order_drops() + pipe.out_of_order_drops() <= 4);
        // Draining index 0 and pushing 2 lets the cache flush through.
        assert_eq!(pipe.pop().await.unwrap().index, 0);
        pipe.push(Droplet::new(scope, 2, 2)).await.unwrap();
        for expected in 1..=4 {
            assert_eq!(pipe.pop().await.unwrap().index, expected);
        }
        timeout(Duration::from_millis(200), blocked)
            .await
            .expect("cached push should complete")
            .unwrap();
        assert_eq!(pipe.pop().await.unwrap().index, 5);
    }

    #[tokio::test]
    async fn end_of_input_is_idempotent_and_fails_pushes() {
        let (pipe, scope) = pipe_with_scope("closed", 2);
        pipe.push(Droplet::new(scope, 0, 0)).await.unwrap();
        pipe.set_end_of_input();
        pipe.set_end_of_input();
        let pushed_before = pipe.drops_pushed();
        match pipe.push(Droplet::new(scope, 1, 1)).await {
            Err(PushError::Closed(d)) => assert_eq!(d.index, 1),
            other => panic!("expected Closed, got {other:?}"),
        }
        // Invariant: drops_pushed stops moving once end-of-input is set.
        assert_eq!(pipe.drops_pushed(), pushed_before);
        // The drop accepted before the close is still drained.
        assert_eq!(pipe.pop().await.unwrap().index, 0);
        assert!(pipe.pop().await.is_none());
        assert!(pipe.pop().await.is_none());
    }

    #[tokio::test]
    async fn unregistered_scope_is_rejected() {
        let pipe: Arc<Pipe<u32>> = Pipe::new("strict", cap(2));
        let foreign = ScopeId::fresh();
        match pipe.push(Droplet::new(foreign, 0, 0)).await {
            Err(PushError::ScopeMismatch(d)) => assert_eq!(d.value, 0),
            other => panic!("expected ScopeMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scopes_are_ordered_independently() {
        let pipe: Arc<Pipe<u32>> = Pipe::new("scopes", cap(4));
        let a = ScopeId::fresh();
        let b = ScopeId::fresh();
        pipe.register_scope(a);
        pipe.register_scope(b);
        pipe.push(Droplet::new(b, 1, 11)).await.unwrap();
        pipe.push(Droplet::new(a, 0, 0)).await.unwrap();
        pipe.push(Droplet::new(b, 0, 10)).await.unwrap();
        let mut a_seen = Vec::new();
        let mut b_seen = Vec::new();
        for _ in 0..3 {
            let d = pipe.pop().await.unwrap();
            if d.scope == a {
                a_seen.push(d.index);
            } else {
                b_seen.push(d.index);
            }
        }
        assert_eq!(a_seen, vec![0]);
        assert_eq!(b_seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn abandoned_push_releases_its_admission() {
        let (pipe, scope) = pipe_with_scope("abandoned", 1);
        pipe.push(Droplet::new(scope, 0, 0)).await.unwrap();
        {
            // Suspend a push, then drop the future without completing it.
            let blocked = pipe.push(Droplet::new(scope, 1, 1));
            futures::pin_mut!(blocked);
            assert!(timeout(Duration::from_millis(20), &mut blocked).await.is_err());
            assert_eq!(pipe.in_push_drops(), 1);
        }
        assert_eq!(pipe.in_push_drops(), 0);
        // The closed sentinel is still reachable.
        pipe.set_end_of_input();
        assert_eq!(pipe.pop().await.unwrap().index, 0);
        assert!(pipe.pop().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_pushers_are_reordered_by_index() {
        let pipe: Arc<Pipe<u64>> = Pipe::new("parallel", cap(4));
        let scope = ScopeId::fresh();
        pipe.register_scope(scope);
        let mut tasks = Vec::new();
        // Push 32 drops from 8 tasks, indices interleaved across tasks.
        for t in 0..8u64 {
            let pipe = pipe.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..4u64 {
                    let index = i * 8 + t;
                    pipe.push(Droplet::new(scope, index, index)).await.unwrap();
                }
            }));
        }
        let consumer = tokio::spawn({
            let pipe = pipe.clone();
            async move {
                let mut seen = Vec::new();
                while let Some(d) = pipe.pop().await {
                    seen.push(d.index);
                }
                seen
            }
        });
        for task in tasks {
            task.await.unwrap();
        }
        pipe.set_end_of_input();
        let seen = timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer should finish")
            .unwrap();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
        assert_eq!(pipe.drops_pushed(), 32);
    }

    #[tokio::test]
    async fn load_statistics_track_occupancy() {
        let (pipe, scope) = pipe_with_scope("load", 4);
        assert_eq!(pipe.current_load(), 0.0);
        pipe.push(Droplet::new(scope, 0, 0)).await.unwrap();
        pipe.push(Droplet::new(scope, 1, 1)).await.unwrap();
        assert_eq!(pipe.current_load(), 0.5);
        let _ = pipe.pop().await.unwrap();
        assert_eq!(pipe.current_load(), 0.25);
        assert!(pipe.average_load() > 0.0);
    }
}
