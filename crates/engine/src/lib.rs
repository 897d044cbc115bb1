// SPDX-License-Identifier: Apache-2.0

//! Staged dataflow worker runtime, pipeline, and graph validator.
//!
//! User code supplies, transforms, fans out/in, and consumes typed values
//! ("drops") through the bounded, order-preserving pipes of
//! [`dropflow_pipe`]; this crate owns everything around them: concurrency,
//! backpressure, lifecycle, cancellation, retries, and structural
//! validation of the assembled graph.
//!
//! The building blocks:
//!
//! - [`Worker`]: a one-shot cancellable executor with bounded concurrency,
//!   retry, and utilization metrics, parameterized by a [`Role`].
//! - The roles in [`roles`]: supplier, function, transformer, action,
//!   consumer, fork, and join shapes over the worker runtime.
//! - [`Pipeline`]: the root object owning the workers; building it runs the
//!   [`Chart`] validator, running it supervises the workers to termination.
//!
//! ```
//! use dropflow_engine::{Pipeline, roles::{Consumer, Supplier}};
//! use dropflow_pipe::SupplyPipe;
//! use std::num::NonZeroUsize;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! # async fn example() -> Result<(), dropflow_engine::Error> {
//! let four = NonZeroUsize::new(4).expect("non-zero");
//! let numbers = SupplyPipe::new("numbers", four);
//! let next = AtomicU32::new(0);
//! let pipeline = Pipeline::from(Supplier::new("gen", four, numbers.clone(), move || {
//!     let n = next.fetch_add(1, Ordering::SeqCst);
//!     Ok((n < 100).then_some(n))
//! }))
//! .through(Consumer::new("print", four, numbers.pipe(), |n: &u32| {
//!     tracing::info!(n, "received");
//!     Ok(())
//! }))
//! .build()?;
//! pipeline.run().await
//! # }
//! ```

pub mod chart;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod retry;
pub mod roles;
pub mod worker;

pub use chart::{Chart, Warning};
pub use error::{Error, TaskError, TaskResult};
pub use node::{PipePort, PipelineWorker, RoleKind, WorkerDescriptor, WorkerMonitoring};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use retry::RetryPolicy;
pub use worker::{CancelCause, Role, TaskPool, Worker, WorkerCx, WorkerState};
