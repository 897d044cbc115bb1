// SPDX-License-Identifier: Apache-2.0

//! Errors for the pipes.
//!
//! Important note: it is important not to use `!Send` data types in errors to
//! ensure these errors can cross task boundaries together with the rejected
//! droplet.

use crate::droplet::Droplet;

/// Errors that can occur pushing a droplet into a pipe.
///
/// Both variants return the rejected droplet to the caller, so a producer
/// that wants the value back either way can recover it with
/// [`into_droplet`](PushError::into_droplet).
#[derive(thiserror::Error, Debug)]
pub enum PushError<T> {
    /// End-of-input was already signaled on the pipe.
    #[error("pipe end-of-input already signaled; the droplet was not accepted")]
    Closed(Droplet<T>),

    /// The droplet's scope is not registered on this pipe and the pipe does
    /// not accept new scopes.
    #[error("droplet scope is not registered on this pipe")]
    ScopeMismatch(Droplet<T>),
}

impl<T> PushError<T> {
    /// Returns the droplet that could not be pushed.
    pub fn into_droplet(self) -> Droplet<T> {
        match self {
            Self::Closed(d) | Self::ScopeMismatch(d) => d,
        }
    }

    /// Returns the rejected user value, discarding the envelope.
    pub fn into_value(self) -> T {
        self.into_droplet().value
    }
}
