// SPDX-License-Identifier: Apache-2.0

//! Retry policy applied around task submissions.
//!
//! A policy is a plain configuration object, not a decorator: the worker
//! runtime wraps every task invocation in [`run_with_retry`], which decides
//! attempts, exponential backoff, and which failures are retryable. A retry
//! that exhausts its attempts propagates the last error, which in turn
//! cancels the worker.

use crate::error::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type RetryPredicate = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// Configuration for retrying failed task invocations.
#[derive(Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts before the failure propagates.
    pub max_retries: usize,
    /// Initial delay in milliseconds before the first retry.
    pub initial_retry_delay_ms: u64,
    /// Maximum delay in milliseconds between retries.
    pub max_retry_delay_ms: u64,
    /// Multiplier applied to the delay for exponential backoff.
    pub backoff_multiplier: f64,
    /// Predicate deciding which failures are retryable; `None` retries all.
    #[serde(skip)]
    retryable: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            backoff_multiplier: 2.0,
            retryable: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_retry_delay_ms", &self.initial_retry_delay_ms)
            .field("max_retry_delay_ms", &self.max_retry_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("retryable", &self.retryable.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl RetryPolicy {
    /// Limits the attempts made on top of the first invocation.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial and maximum backoff delays.
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_retry_delay_ms = initial.as_millis() as u64;
        self.max_retry_delay_ms = max.as_millis() as u64;
        self
    }

    /// Restricts retrying to failures accepted by `predicate`.
    #[must_use]
    pub fn with_retryable(
        mut self,
        predicate: impl Fn(&TaskError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    /// Whether `error` qualifies for another attempt.
    #[must_use]
    pub fn is_retryable(&self, error: &TaskError) -> bool {
        self.retryable.as_ref().is_none_or(|accepts| accepts(error))
    }

    /// Backoff before retry attempt `attempt` (1-based), capped at the
    /// maximum delay.
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_retry_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1))
        .min(self.max_retry_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

/// Invokes `op`, retrying per `policy` until it succeeds, the failure is not
/// retryable, attempts are exhausted, or `token` is cancelled mid-backoff.
pub(crate) async fn run_with_retry<T>(
    policy: Option<&RetryPolicy>,
    token: &CancellationToken,
    worker: &str,
    op: impl Fn() -> TaskResult<T>,
) -> TaskResult<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) => {
                let Some(policy) = policy else {
                    return Err(error);
                };
                attempt += 1;
                if attempt > policy.max_retries || !policy.is_retryable(&error) {
                    tracing::debug!(
                        worker,
                        attempt,
                        error = %error,
                        "task failed beyond retry policy"
                    );
                    return Err(error);
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    worker,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying task"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(error),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn boom() -> TaskError {
        "boom".into()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 250,
            backoff_multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
        assert_eq!(policy.delay_for(8), Duration::from_millis(250));
    }

    #[test]
    fn serde_round_trip_keeps_settings() {
        let policy = RetryPolicy::default().with_max_retries(5);
        let json = serde_json::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_retries, 5);
        assert_eq!(back.initial_retry_delay_ms, policy.initial_retry_delay_ms);
        assert_eq!(back.backoff_multiplier, policy.backoff_multiplier);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy::default().with_delays(
            Duration::from_millis(1),
            Duration::from_millis(2),
        );
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let result = run_with_retry(Some(&policy), &token, "w", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(boom())
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_propagate_last_error() {
        let policy = RetryPolicy::default()
            .with_max_retries(2)
            .with_delays(Duration::from_millis(1), Duration::from_millis(1));
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let result: TaskResult<u32> = run_with_retry(Some(&policy), &token, "w", || {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            Err(boom())
        })
        .await;
        assert!(result.is_err());
        // One initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(1), Duration::from_millis(1))
            .with_retryable(|error| error.to_string().contains("transient"));
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let result: TaskResult<u32> = run_with_retry(Some(&policy), &token, "w", || {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            Err(boom())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_policy_means_single_attempt() {
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let result: TaskResult<u32> = run_with_retry(None, &token, "w", || {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            Err(boom())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
