//! Ordered, named step collections and their sequential executor.
//!
//! Steps run one at a time in declaration order. The step list is
//! append-only until the first step runs. A failing step stops the run;
//! the [`crate::orchestrator::Orchestrator`] adds policies on top.
//!
//! # Example
//!
//! ```rust,ignore
//! use driver_lifecycle::steps::{ModuleUnloadStep, PackageRemovalStep};
//! use driver_lifecycle::workflow::Workflow;
//!
//! let mut workflow = Workflow::new("uninstall");
//! workflow.add_step(ModuleUnloadStep::default())?;
//! workflow.add_step(PackageRemovalStep::discovered())?;
//!
//! let result = workflow.execute(&ctx);
//! if result.status.is_failed() {
//!     workflow.rollback(&ctx)?;
//! }
//! ```

use anyhow::{anyhow, bail, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::context::ExecutionContext;
use crate::step::{run_step, Step, StepResult, StepStatus};

/// Final state of a plain workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_failed(&self) -> bool {
        *self == WorkflowStatus::Failed
    }
}

#[derive(Debug)]
pub struct WorkflowResult {
    pub workflow: String,
    pub status: WorkflowStatus,
    /// Every step that ran, in order.
    pub step_results: Vec<(String, StepResult)>,
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<anyhow::Error>,
    pub duration: Duration,
}

pub struct Workflow {
    name: String,
    steps: Vec<Box<dyn Step>>,
    /// Indices of completed steps, in completion order.
    completed: Vec<usize>,
    /// A failed step that reported partial, reversible effects.
    partial: Option<usize>,
    started: bool,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            completed: Vec::new(),
            partial: None,
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a step. Fails once execution has started.
    pub fn add_step(&mut self, step: impl Step + 'static) -> Result<()> {
        self.add_boxed(Box::new(step))
    }

    pub fn add_boxed(&mut self, step: Box<dyn Step>) -> Result<()> {
        if self.started {
            bail!(
                "cannot add step '{}' to workflow '{}' after execution started",
                step.name(),
                self.name
            );
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&dyn Step> {
        self.steps.get(index).map(|s| s.as_ref())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn completed_steps(&self) -> Vec<&str> {
        self.completed.iter().map(|&i| self.steps[i].name()).collect()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Run the step at `index` and record its completion.
    pub fn run_step(&mut self, index: usize, ctx: &ExecutionContext) -> Result<StepResult> {
        let step = self
            .steps
            .get(index)
            .ok_or_else(|| anyhow!("workflow '{}' has no step {}", self.name, index))?;
        self.started = true;

        let result = run_step(step.as_ref(), ctx);
        match result.status {
            StepStatus::Completed => self.completed.push(index),
            StepStatus::Skipped => {}
            StepStatus::Failed => {
                if result.can_rollback {
                    self.partial = Some(index);
                }
            }
        }
        Ok(result)
    }

    /// Run every step in order, stopping at the first failure or on
    /// cancellation.
    pub fn execute(&mut self, ctx: &ExecutionContext) -> WorkflowResult {
        let started = Instant::now();
        let mut result = WorkflowResult {
            workflow: self.name.clone(),
            status: WorkflowStatus::Completed,
            step_results: Vec::new(),
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            duration: Duration::ZERO,
        };
        info!(workflow = %self.name, steps = self.steps.len(), "workflow started");

        for index in 0..self.steps.len() {
            if ctx.is_cancelled() {
                result.status = WorkflowStatus::Cancelled;
                break;
            }
            let name = self.steps[index].name().to_string();
            let step_result = match self.run_step(index, ctx) {
                Ok(r) => r,
                Err(e) => StepResult::failed(e),
            };
            let failed = step_result.is_failed();
            let cancelled = step_result.is_cancelled();
            if step_result.status == StepStatus::Completed {
                result.completed_steps.push(name.clone());
            }
            if failed {
                result.failed_step = Some(name.clone());
                result.error = Some(anyhow!("{}", step_result.message));
            }
            result.step_results.push((name, step_result));
            if cancelled {
                result.status = WorkflowStatus::Cancelled;
                break;
            }
            if failed {
                result.status = WorkflowStatus::Failed;
                break;
            }
        }

        result.duration = started.elapsed();
        info!(workflow = %self.name, status = ?result.status, "workflow finished");
        result
    }

    /// Steps to undo, most recent first: a partially failed step, then
    /// completed steps in reverse.
    pub fn rollback_order(&self) -> Vec<&dyn Step> {
        let mut order = Vec::new();
        if let Some(index) = self.partial {
            order.push(self.steps[index].as_ref());
        }
        for &index in self.completed.iter().rev() {
            order.push(self.steps[index].as_ref());
        }
        order.retain(|s| s.can_rollback());
        order
    }

    /// Roll back completed reversible steps in reverse order.
    ///
    /// Every step is attempted; the first error is returned.
    pub fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let mut first_error = None;
        for step in self.rollback_order() {
            info!(step = step.name(), "rolling back");
            if let Err(e) = step.rollback(ctx) {
                warn!(step = step.name(), error = %format!("{:#}", e), "rollback failed, continuing");
                first_error.get_or_insert(e.context(format!("rolling back step '{}'", step.name())));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("completed", &self.completed_steps())
            .field("started", &self.started)
            .finish()
    }
}
