//! The unit of work every workflow is built from.
//!
//! A [`Step`] has four operations:
//!
//! - `validate` - pure precondition check. Never mutates anything.
//! - `execute` - performs the side effect and returns a [`StepResult`].
//!   Records into the shared state whatever `rollback` will need, including
//!   on partial failure. Checks cancellation between externally visible
//!   sub-operations.
//! - `rollback` - best-effort inverse driven only by recorded state. A no-op
//!   when nothing was done; continues past individual failures and returns
//!   the first one.
//! - `can_rollback` - whether the step is reversible as configured.
//!
//! In dry-run mode `execute` logs intended actions, performs no mutating
//! calls and records no completion state, so `rollback` does nothing.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::is_cancelled;

/// Outcome of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of [`Step::execute`].
///
/// `Failed` always carries an error; `Completed` and `Skipped` never do.
#[derive(Debug)]
pub struct StepResult {
    pub status: StepStatus,
    pub message: String,
    pub error: Option<anyhow::Error>,
    pub duration: Duration,
    pub can_rollback: bool,
}

impl StepResult {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Completed,
            message: message.into(),
            error: None,
            duration: Duration::ZERO,
            can_rollback: false,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            message: message.into(),
            error: None,
            duration: Duration::ZERO,
            can_rollback: false,
        }
    }

    /// A failure whose message is the rendered error chain.
    pub fn failed(error: anyhow::Error) -> Self {
        let message = format!("{:#}", error);
        Self::failed_with(message, error)
    }

    pub fn failed_with(message: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            status: StepStatus::Failed,
            message: message.into(),
            error: Some(error),
            duration: Duration::ZERO,
            can_rollback: false,
        }
    }

    pub fn with_rollback(mut self, can_rollback: bool) -> Self {
        self.can_rollback = can_rollback;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    /// Failed because cancellation was observed, not because of a fault.
    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(is_cancelled)
    }
}

/// A named, validatable, executable, optionally reversible unit of work.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn validate(&self, ctx: &ExecutionContext) -> Result<()>;

    fn execute(&self, ctx: &ExecutionContext) -> StepResult;

    fn rollback(&self, ctx: &ExecutionContext) -> Result<()>;

    fn can_rollback(&self) -> bool;
}

/// Validate then execute `step`, stamping the duration.
///
/// A validation failure is returned as a `Failed` result without calling
/// `execute`.
pub fn run_step(step: &dyn Step, ctx: &ExecutionContext) -> StepResult {
    let started = Instant::now();
    debug!(step = step.name(), "validating");
    if let Err(e) = step.validate(ctx) {
        warn!(step = step.name(), error = %format!("{:#}", e), "validation failed");
        let e = e.context(format!("step '{}' failed validation", step.name()));
        return StepResult::failed(e).with_duration(started.elapsed());
    }

    let mut result = step.execute(ctx);
    result.duration = started.elapsed();
    if result.status == StepStatus::Failed && result.error.is_none() {
        let message = if result.message.is_empty() {
            format!("step '{}' failed", step.name())
        } else {
            result.message.clone()
        };
        result.error = Some(anyhow::anyhow!(message.clone()));
        result.message = message;
    }
    result
}
