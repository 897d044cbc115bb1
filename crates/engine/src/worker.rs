// SPDX-License-Identifier: Apache-2.0

//! The one-shot cancellable worker runtime.
//!
//! A [`Worker`] pairs the shared runtime (lifecycle, shared error,
//! cancellation, utilization, bounded task pool) with a [`Role`] that
//! supplies the component-specific work loop. Running a worker performs, in
//! order: start the utilization clock, the role's `work` loop, the user
//! close hook, the role's `internal_close` (e.g. signaling end-of-input on
//! outputs), stop the clock, and the transition to a terminal state. Every
//! step runs even if an earlier one failed; the first captured error is
//! surfaced, later ones are recorded as suppressed.
//!
//! Cancellation is cooperative but forceful: it records the shared error
//! (first-write-wins), trips the worker's cancellation token — waking every
//! pipe suspension and pool admission owned by the worker — and makes
//! not-yet-started tasks short-circuit. A task already inside a user
//! callback finishes the callback; cancellation takes effect at its next
//! suspension point.

use crate::error::{Error, ErrorSlot, TaskResult};
use crate::node::{PipePort, PipelineWorker, RoleKind, WorkerDescriptor, WorkerMonitoring};
use crate::retry::{RetryPolicy, run_with_retry};
use dropflow_pipe::Meter;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Process-scoped counter for generated worker names.
static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a worker. Single-shot:
/// `Ready → Running → (Done | Cancelled)`.
///
/// Note that `Running` covers the close phase as well; there is no separate
/// closing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not yet run.
    Ready,
    /// `run` is in progress (including the close phase).
    Running,
    /// Terminated without cancellation or failure.
    Done,
    /// Terminated after cancellation or failure.
    Cancelled,
}

impl WorkerState {
    /// Whether this is a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Cancelled => "Cancelled",
        };
        write!(f, "{label}")
    }
}

/// Why a worker is being cancelled.
///
/// `Silent` is the quiet-termination request: the worker still ends in the
/// `Cancelled` state but surfaces no error — this is what the pipeline's
/// `stop` uses. Cancelling a single worker silently while its dependents
/// keep running may leave those dependents waiting forever; stopping the
/// whole pipeline instead cancels every worker.
#[derive(Debug, Clone)]
pub enum CancelCause {
    /// Record the given error as the worker's failure (first-write-wins).
    Failure(Error),
    /// Record an [`Error::Interrupted`] failure.
    Interrupt,
    /// Terminate without surfacing an error.
    Silent,
}

type CloseHook = Box<dyn FnOnce() -> TaskResult<()> + Send>;

/// Shared runtime state of a worker.
pub(crate) struct WorkerCore {
    name: String,
    concurrency: NonZeroUsize,
    internal: bool,
    state: watch::Sender<WorkerState>,
    started: AtomicBool,
    token: CancellationToken,
    errors: ErrorSlot,
    silent: AtomicBool,
    retry: Mutex<Option<RetryPolicy>>,
    cancelled_work: AtomicU64,
    busy: AtomicUsize,
    utilization: Meter,
    on_close: Mutex<Option<CloseHook>>,
}

impl WorkerCore {
    fn new(name: String, concurrency: NonZeroUsize) -> Self {
        let (state, _) = watch::channel(WorkerState::Ready);
        Self {
            name,
            concurrency,
            internal: false,
            state,
            started: AtomicBool::new(false),
            token: CancellationToken::new(),
            errors: ErrorSlot::default(),
            silent: AtomicBool::new(false),
            retry: Mutex::new(None),
            cancelled_work: AtomicU64::new(0),
            busy: AtomicUsize::new(0),
            utilization: Meter::new(),
            on_close: Mutex::new(None),
        }
    }

    fn cancel(&self, cause: CancelCause) {
        match cause {
            CancelCause::Failure(error) => {
                if self.errors.record(error) {
                    tracing::debug!(worker = %self.name, "worker cancelling on failure");
                }
            }
            CancelCause::Interrupt => {
                let _ = self.errors.record(Error::Interrupted {
                    worker: self.name.clone(),
                });
            }
            CancelCause::Silent => self.silent.store(true, Ordering::Release),
        }
        self.token.cancel();
    }
}

/// Execution context handed to a role's work loop and its tasks.
///
/// Cheap to clone; tasks carry a clone across the spawn boundary.
#[derive(Clone)]
pub struct WorkerCx {
    core: Arc<WorkerCore>,
    retry: Option<RetryPolicy>,
}

impl WorkerCx {
    /// The worker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The worker's parallelism bound.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.core.concurrency.get()
    }

    /// The worker's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.core.token
    }

    /// Cancels the worker with `error`.
    pub fn fail(&self, error: Error) {
        self.core.cancel(CancelCause::Failure(error));
    }

    /// Counts a task that terminated abnormally after submission.
    pub fn count_cancelled(&self) {
        let _ = self.core.cancelled_work.fetch_add(1, Ordering::Relaxed);
    }

    /// Invokes a user callback under the worker's retry policy, metering the
    /// invocation (including backoff) as busy time.
    pub async fn invoke<T>(&self, op: impl Fn() -> TaskResult<T>) -> TaskResult<T> {
        let _busy = BusyGuard::enter(&self.core);
        run_with_retry(self.retry.as_ref(), &self.core.token, &self.core.name, op).await
    }
}

/// Scope guard accounting one busy task slot.
struct BusyGuard {
    core: Arc<WorkerCore>,
}

impl BusyGuard {
    fn enter(core: &Arc<WorkerCore>) -> Self {
        let busy = core.busy.fetch_add(1, Ordering::Relaxed) + 1;
        core.utilization
            .set(busy as f64 / core.concurrency.get() as f64);
        Self { core: core.clone() }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let busy = self.core.busy.fetch_sub(1, Ordering::Relaxed) - 1;
        self.core
            .utilization
            .set(busy as f64 / self.core.concurrency.get() as f64);
    }
}

/// Bounded in-flight task set of a worker.
///
/// Submission suspends while all `concurrency` slots are busy — this is the
/// knob that bounds a worker's memory: it never holds more in-flight tasks
/// than its concurrency. Tasks submitted after cancellation short-circuit
/// and count as cancelled work; a panicking task cancels the worker.
pub struct TaskPool {
    cx: WorkerCx,
    tasks: JoinSet<()>,
}

impl TaskPool {
    /// Creates the pool for a role's work loop.
    #[must_use]
    pub fn new(cx: &WorkerCx) -> Self {
        Self {
            cx: cx.clone(),
            tasks: JoinSet::new(),
        }
    }

    /// Submits a task, suspending until a slot is free.
    pub async fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        while self.tasks.len() >= self.cx.concurrency() {
            self.reap().await;
        }
        if self.cx.token().is_cancelled() {
            self.cx.count_cancelled();
            return;
        }
        let _ = self.tasks.spawn(task);
    }

    /// Joins all in-flight tasks.
    pub async fn drain(&mut self) {
        while !self.tasks.is_empty() {
            self.reap().await;
        }
    }

    async fn reap(&mut self) {
        if let Some(joined) = self.tasks.join_next().await {
            if let Err(join_error) = joined {
                self.cx.count_cancelled();
                if join_error.is_panic() {
                    self.cx.fail(Error::Task {
                        worker: self.cx.name().to_owned(),
                        message: format!("task panicked: {join_error}"),
                    });
                }
            }
        }
    }
}

/// A worker shape: the component-specific loops over the worker runtime.
#[async_trait::async_trait]
pub trait Role: Send + Sync + 'static {
    /// The role's shape tag.
    fn kind(&self) -> RoleKind;

    /// The pipes the role reads from.
    fn inputs(&self) -> Vec<PipePort>;

    /// The pipes the role writes to.
    fn outputs(&self) -> Vec<PipePort>;

    /// The work loop: pulls from inputs and submits tasks until the inputs
    /// end or the worker is cancelled. Must drain its task pool before
    /// returning.
    async fn work(&self, cx: &WorkerCx) -> Result<(), Error>;

    /// Runtime close hook, run exactly once after `work` and the user close
    /// hook — e.g. signaling end-of-input on the role's outputs.
    async fn internal_close(&self, cx: &WorkerCx) -> Result<(), Error>;
}

/// A one-shot concurrent worker executing a [`Role`].
pub struct Worker<R: Role> {
    core: Arc<WorkerCore>,
    role: R,
}

impl<R: Role> Worker<R> {
    /// Creates a worker over `role` with the given parallelism bound.
    ///
    /// An empty name is replaced by a generated `worker-N` name from a
    /// process-scoped counter.
    #[must_use]
    pub fn new(name: impl Into<String>, concurrency: NonZeroUsize, role: R) -> Self {
        let mut name = name.into();
        if name.is_empty() {
            name = format!("worker-{}", NEXT_WORKER.fetch_add(1, Ordering::Relaxed));
        }
        Self {
            core: Arc::new(WorkerCore::new(name, concurrency)),
            role,
        }
    }

    /// Marks the worker as runtime-internal, exempting it from the
    /// discovery warning.
    #[must_use]
    pub fn internal(mut self) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.internal = true;
        }
        self
    }

    /// Attaches a close hook, run exactly once after the work loop — even
    /// when the worker fails or is cancelled.
    #[must_use]
    pub fn on_close(self, hook: impl FnOnce() -> TaskResult<()> + Send + 'static) -> Self {
        *self.core.on_close.lock() = Some(Box::new(hook));
        self
    }

    /// Requests an interrupt: equivalent to cancelling with
    /// [`CancelCause::Interrupt`].
    pub fn interrupt(&self) {
        self.core.cancel(CancelCause::Interrupt);
    }

    pub(crate) fn role(&self) -> &R {
        &self.role
    }
}

impl<R: Role> WorkerMonitoring for Worker<R> {
    fn state(&self) -> WorkerState {
        *self.core.state.borrow()
    }

    fn concurrency(&self) -> usize {
        self.core.concurrency.get()
    }

    fn cancelled_work(&self) -> u64 {
        self.core.cancelled_work.load(Ordering::Relaxed)
    }

    fn current_utilization(&self) -> f64 {
        self.core.utilization.current()
    }

    fn average_utilization(&self) -> f64 {
        self.core.utilization.average()
    }
}

#[async_trait::async_trait]
impl<R: Role> PipelineWorker for Worker<R> {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn descriptor(&self) -> WorkerDescriptor {
        WorkerDescriptor {
            name: self.core.name.clone(),
            kind: self.role.kind(),
            internal: self.core.internal,
            inputs: self.role.inputs(),
            outputs: self.role.outputs(),
        }
    }

    async fn run(self: Arc<Self>) -> Result<(), Error> {
        let core = &self.core;
        if core.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Reused {
                worker: core.name.clone(),
            });
        }
        core.utilization.reset();
        // send_replace: the transition must land even with no subscriber.
        let _ = core.state.send_replace(WorkerState::Running);
        tracing::debug!(
            worker = %core.name,
            concurrency = core.concurrency.get(),
            role = %self.role.kind(),
            "worker running"
        );
        let cx = WorkerCx {
            core: core.clone(),
            retry: core.retry.lock().clone(),
        };
        if let Err(error) = self.role.work(&cx).await {
            let _ = core.errors.record(error);
        }
        let hook = core.on_close.lock().take();
        if let Some(hook) = hook {
            if let Err(error) = hook() {
                let _ = core.errors.record(Error::Task {
                    worker: core.name.clone(),
                    message: error.to_string(),
                });
            }
        }
        if let Err(error) = self.role.internal_close(&cx).await {
            let _ = core.errors.record(error);
        }
        core.utilization.stop();
        let (primary, suppressed) = core.errors.snapshot();
        let cancelled =
            primary.is_some() || core.silent.load(Ordering::Acquire) || core.token.is_cancelled();
        let terminal = if cancelled {
            WorkerState::Cancelled
        } else {
            WorkerState::Done
        };
        let _ = core.state.send_replace(terminal);
        if !suppressed.is_empty() {
            tracing::debug!(
                worker = %core.name,
                suppressed = suppressed.len(),
                "worker recorded suppressed errors"
            );
        }
        match primary {
            Some(error) => {
                tracing::warn!(worker = %core.name, %error, "worker failed");
                Err(error)
            }
            None => {
                tracing::debug!(worker = %core.name, state = %terminal, "worker finished");
                Ok(())
            }
        }
    }

    fn cancel(&self, cause: CancelCause) {
        self.core.cancel(cause);
    }

    async fn join(&self) {
        let mut state = self.core.state.subscribe();
        let _ = state.wait_for(|state| state.is_terminal()).await;
    }

    fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), Error> {
        if self.core.started.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStarted {
                worker: self.core.name.clone(),
            });
        }
        *self.core.retry.lock() = Some(policy);
        Ok(())
    }

    fn failure(&self) -> Option<Error> {
        self.core.errors.snapshot().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    fn two() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }

    /// Test role that runs a caller-provided work loop.
    struct Scripted {
        work: Box<dyn Fn(WorkerCx) -> Result<(), Error> + Send + Sync>,
    }

    impl Scripted {
        fn ok() -> Self {
            Self {
                work: Box::new(|_| Ok(())),
            }
        }

        fn failing(message: &str) -> Self {
            let message = message.to_owned();
            Self {
                work: Box::new(move |cx| {
                    Err(Error::Task {
                        worker: cx.name().to_owned(),
                        message: message.clone(),
                    })
                }),
            }
        }
    }

    #[async_trait::async_trait]
    impl Role for Scripted {
        fn kind(&self) -> RoleKind {
            RoleKind::Consumer
        }

        fn inputs(&self) -> Vec<PipePort> {
            Vec::new()
        }

        fn outputs(&self) -> Vec<PipePort> {
            Vec::new()
        }

        async fn work(&self, cx: &WorkerCx) -> Result<(), Error> {
            (self.work)(cx.clone())
        }

        async fn internal_close(&self, _cx: &WorkerCx) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_is_single_shot() {
        let worker = Arc::new(Worker::new("once", two(), Scripted::ok()));
        assert_eq!(worker.state(), WorkerState::Ready);
        worker.clone().run().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Done);
        match worker.clone().run().await {
            Err(Error::Reused { worker: name }) => assert_eq!(name, "once"),
            other => panic!("expected Reused, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_work_surfaces_and_cancels() {
        let worker = Arc::new(Worker::new("boom", two(), Scripted::failing("kaput")));
        let error = worker.clone().run().await.unwrap_err();
        assert!(matches!(error, Error::Task { .. }));
        assert_eq!(worker.state(), WorkerState::Cancelled);
        assert_eq!(worker.failure(), Some(error));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let worker = Arc::new(Worker::new("cancelled", two(), Scripted::ok()));
        let first = Error::Task {
            worker: "cancelled".into(),
            message: "first".into(),
        };
        worker.cancel(CancelCause::Failure(first.clone()));
        worker.cancel(CancelCause::Failure(Error::Task {
            worker: "cancelled".into(),
            message: "second".into(),
        }));
        worker.cancel(CancelCause::Failure(first.clone()));
        let error = worker.clone().run().await.unwrap_err();
        assert_eq!(error, first);
        assert_eq!(worker.state(), WorkerState::Cancelled);
    }

    #[tokio::test]
    async fn interrupt_surfaces_interrupted() {
        let worker = Arc::new(Worker::new("interrupted", two(), Scripted::ok()));
        worker.interrupt();
        let error = worker.clone().run().await.unwrap_err();
        assert!(matches!(error, Error::Interrupted { .. }));
        assert_eq!(worker.state(), WorkerState::Cancelled);
    }

    #[tokio::test]
    async fn silent_cancel_surfaces_no_error() {
        let worker = Arc::new(Worker::new("quiet", two(), Scripted::ok()));
        worker.cancel(CancelCause::Silent);
        worker.clone().run().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Cancelled);
        assert_eq!(worker.failure(), None);
    }

    #[tokio::test]
    async fn close_hook_runs_exactly_once_even_on_failure() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let worker = Arc::new(
            Worker::new("closer", two(), Scripted::failing("kaput")).on_close(move || {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let _ = worker.clone().run().await.unwrap_err();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_hook_error_is_surfaced_without_prior_failure() {
        let worker = Arc::new(
            Worker::new("bad-close", two(), Scripted::ok()).on_close(|| Err("close failed".into())),
        );
        let error = worker.clone().run().await.unwrap_err();
        match error {
            Error::Task { message, .. } => assert_eq!(message, "close failed"),
            other => panic!("expected Task, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_policy_is_rejected_after_start() {
        let worker = Arc::new(Worker::new("late", two(), Scripted::ok()));
        worker.set_retry_policy(RetryPolicy::default()).unwrap();
        worker.clone().run().await.unwrap();
        assert!(matches!(
            worker.set_retry_policy(RetryPolicy::default()),
            Err(Error::AlreadyStarted { .. })
        ));
    }

    #[tokio::test]
    async fn join_waits_for_terminal_state() {
        let worker = Arc::new(Worker::new("joined", two(), Scripted::ok()));
        let waiter = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.join().await })
        };
        tokio::task::yield_now().await;
        worker.clone().run().await.unwrap();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("join should release once the worker terminates")
            .unwrap();
    }

    #[tokio::test]
    async fn empty_name_is_generated() {
        let worker = Worker::new("", two(), Scripted::ok());
        assert!(PipelineWorker::name(&worker).starts_with("worker-"));
    }

    /// Role whose work loop floods the pool to probe the admission bound.
    struct Flood {
        observed_peak: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Role for Flood {
        fn kind(&self) -> RoleKind {
            RoleKind::Supplier
        }

        fn inputs(&self) -> Vec<PipePort> {
            Vec::new()
        }

        fn outputs(&self) -> Vec<PipePort> {
            Vec::new()
        }

        async fn work(&self, cx: &WorkerCx) -> Result<(), Error> {
            let running = Arc::new(AtomicUsize::new(0));
            let mut pool = TaskPool::new(cx);
            for _ in 0..16 {
                let running = running.clone();
                let peak = self.observed_peak.clone();
                pool.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let _ = running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }
            pool.drain().await;
            Ok(())
        }

        async fn internal_close(&self, _cx: &WorkerCx) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn task_pool_bounds_in_flight_tasks() {
        let observed_peak = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(Worker::new(
            "flood",
            two(),
            Flood {
                observed_peak: observed_peak.clone(),
            },
        ));
        worker.clone().run().await.unwrap();
        let peak = observed_peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "more than `concurrency` tasks ran at once: {peak}");
        assert!(peak >= 1);
    }
}
