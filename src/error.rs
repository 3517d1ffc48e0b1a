//! Error types that callers need to classify.
//!
//! Most of the crate returns `anyhow::Result`. The types here are the few
//! errors whose *kind* matters to the caller: the process collaborator's
//! failure classes, and cancellation, which is an outcome rather than a fault.

use std::time::Duration;
use thiserror::Error;

/// Failure to run an external command.
///
/// A command that runs and exits non-zero is NOT an `ExecError`; its exit
/// code is returned as data in [`crate::process::CommandOutput`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command did not finish within its timeout and was killed.
    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The command could not be started or waited on.
    #[error("failed to execute '{program}': {message}")]
    ExecutionFailed { program: String, message: String },

    /// Anything else the executor could not classify.
    #[error("{0}")]
    Unspecified(String),
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// Marker error for cooperative cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// True if `err` (or anything in its chain) is a [`Cancelled`] marker.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}
