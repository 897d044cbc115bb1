// SPDX-License-Identifier: Apache-2.0

//! Errors for the worker runtime and the pipeline.
//!
//! Important note: runtime errors carry their diagnostics as strings and are
//! `Clone`, so one failure can be surfaced as a worker's primary error and
//! aggregated again at the pipeline level without ownership gymnastics.

use dropflow_pipe::PushError;
use parking_lot::Mutex;

/// Error type produced by user callbacks.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for user callbacks.
pub type TaskResult<T> = Result<T, TaskError>;

/// All errors that can occur in the worker runtime and the pipeline.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The assembled graph is invalid; the pipeline does not run.
    #[error("invalid pipeline configuration: {message}")]
    Configuration {
        /// Why the configuration was rejected.
        message: String,
    },

    /// The worker was cooperatively interrupted.
    #[error("worker `{worker}` was interrupted")]
    Interrupted {
        /// The worker that was interrupted.
        worker: String,
    },

    /// A user callback failed (or a submitted task panicked).
    #[error("task in worker `{worker}` failed: {message}")]
    Task {
        /// The worker whose task failed.
        worker: String,
        /// The failure rendered by the callback's error.
        message: String,
    },

    /// A push hit a pipe whose end-of-input was already signaled.
    ///
    /// Typically the result of a race between a supplier closing the pipe
    /// and an in-flight push; with several suppliers sharing a supply pipe
    /// the close must be coordinated by the caller.
    #[error("worker `{worker}` pushed into closed pipe `{pipe}`")]
    PipeClosed {
        /// The pushing worker.
        worker: String,
        /// The closed pipe.
        pipe: String,
    },

    /// A push carried a scope the target pipe never had registered.
    #[error("worker `{worker}` pushed a drop from an unregistered scope into pipe `{pipe}`")]
    ScopeMismatch {
        /// The pushing worker.
        worker: String,
        /// The rejecting pipe.
        pipe: String,
    },

    /// `run` was called on a worker that already ran.
    #[error("worker `{worker}` can only be run once")]
    Reused {
        /// The worker that was reused.
        worker: String,
    },

    /// A before-start operation was attempted after the worker started.
    #[error("worker `{worker}` has already started")]
    AlreadyStarted {
        /// The worker that already started.
        worker: String,
    },

    /// `run` was called on a pipeline that already ran.
    #[error("pipeline can only be run once")]
    PipelineReused,

    /// The pipeline was cancelled with a caller-supplied error.
    #[error("pipeline cancelled: {message}")]
    Cancelled {
        /// The caller's error, rendered.
        message: String,
    },
}

/// Maps a pipe push failure to the runtime error for `worker` and `pipe`.
pub(crate) fn push_failure<T>(worker: &str, pipe: &str, error: &PushError<T>) -> Error {
    match error {
        PushError::Closed(_) => Error::PipeClosed {
            worker: worker.to_owned(),
            pipe: pipe.to_owned(),
        },
        PushError::ScopeMismatch(_) => Error::ScopeMismatch {
            worker: worker.to_owned(),
            pipe: pipe.to_owned(),
        },
    }
}

/// First-error-wins slot with a suppressed chain.
///
/// The first recorded error becomes the primary; later distinct errors are
/// kept as suppressed diagnostics. Recording an error equal to one already
/// held is a no-op, so repeated cancellation cannot change the outcome.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot {
    inner: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    primary: Option<Error>,
    suppressed: Vec<Error>,
}

impl ErrorSlot {
    /// Records `error`; returns `true` if it became the primary.
    pub(crate) fn record(&self, error: Error) -> bool {
        let mut slot = self.inner.lock();
        match &slot.primary {
            None => {
                slot.primary = Some(error);
                true
            }
            Some(primary) => {
                if *primary != error && !slot.suppressed.contains(&error) {
                    slot.suppressed.push(error);
                }
                false
            }
        }
    }

    pub(crate) fn has_primary(&self) -> bool {
        self.inner.lock().primary.is_some()
    }

    /// Clones out the primary error and the suppressed chain.
    pub(crate) fn snapshot(&self) -> (Option<Error>, Vec<Error>) {
        let slot = self.inner.lock();
        (slot.primary.clone(), slot.suppressed.clone())
    }
}
