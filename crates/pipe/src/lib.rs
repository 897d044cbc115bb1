// SPDX-License-Identifier: Apache-2.0

//! Bounded, order-preserving pipes for staged dataflow pipelines.
//!
//! A [`Pipe`] is a multi-producer, multi-consumer bounded queue of
//! [`Droplet`]s. Unlike a plain channel, a pipe restores the order in which
//! drops were introduced at their supply point: every droplet carries the
//! index assigned by its [index scope](ScopeId), and a pipe only hands out a
//! droplet once all lower-indexed droplets of the same scope have been handed
//! out before it. A [`SupplyPipe`] is the pipe variant that originates a new
//! index scope (and optionally filters pushes through a predicate).
//!
//! Important note: pipes are shared between the producing and the consuming
//! workers of a pipeline and have no owner of their own; all operations take
//! `&self` and the pipe state is guarded by a single lock per pipe.

pub mod droplet;
pub mod error;
pub mod meter;
pub mod monitor;
pub mod pipe;
pub mod supply;

pub use droplet::{Droplet, ScopeId};
pub use error::PushError;
pub use meter::Meter;
pub use monitor::{PipeHandle, PipeInfo, PipeMonitoring};
pub use pipe::{Pipe, PipeId};
pub use supply::SupplyPipe;
