//! Workflow driver with hooks, an event log, an error policy and a report.
//!
//! The orchestrator owns a [`Workflow`] and runs it step by step:
//!
//! ```text
//! for each step:
//!     cancelled? ──yes──> Cancelled, stop
//!     before_step hooks
//!     validate + execute
//!     after_step hooks
//!     failed? ──> on_error hooks ──> StopOnError: stop
//!                                    ContinueOnError: next step
//! harvest shared state into the report
//! Failed and rollback_on_failure? ──> roll back in reverse, re-harvest
//! on_complete hooks
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use driver_lifecycle::orchestrator::{ErrorPolicy, Orchestrator, OrchestratorOptions};
//!
//! let mut orchestrator = Orchestrator::new(workflow).with_options(OrchestratorOptions {
//!     error_policy: ErrorPolicy::StopOnError,
//!     rollback_on_failure: true,
//! });
//! orchestrator.on_error(|step, err, _ctx| eprintln!("{} failed: {:#}", step, err));
//!
//! let report = orchestrator.execute(&ctx);
//! println!("{}", report.to_json()?);
//! ```

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::ExecutionContext;
use crate::report::{EventKind, ExecutionReport, ReportStatus};
use crate::step::{StepResult, StepStatus};
use crate::workflow::Workflow;

/// What to do after a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    StopOnError,
    /// Keep running later steps. The run still ends `Failed`.
    ContinueOnError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub error_policy: ErrorPolicy,
    /// Roll back completed reversible steps when the run ends `Failed`.
    pub rollback_on_failure: bool,
}

type StepHook = Box<dyn Fn(&str, &ExecutionContext) + Send + Sync>;
type AfterStepHook = Box<dyn Fn(&str, &StepResult, &ExecutionContext) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, &anyhow::Error, &ExecutionContext) + Send + Sync>;
type CompleteHook = Box<dyn Fn(&ExecutionReport) + Send + Sync>;

pub struct Orchestrator {
    workflow: Workflow,
    options: OrchestratorOptions,
    before_step: Vec<StepHook>,
    after_step: Vec<AfterStepHook>,
    on_error: Vec<ErrorHook>,
    on_complete: Vec<CompleteHook>,
}

impl Orchestrator {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            options: OrchestratorOptions::default(),
            before_step: Vec::new(),
            after_step: Vec::new(),
            on_error: Vec::new(),
            on_complete: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> OrchestratorOptions {
        self.options
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn before_step<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&str, &ExecutionContext) + Send + Sync + 'static,
    {
        self.before_step.push(Box::new(hook));
        self
    }

    pub fn after_step<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&str, &StepResult, &ExecutionContext) + Send + Sync + 'static,
    {
        self.after_step.push(Box::new(hook));
        self
    }

    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&str, &anyhow::Error, &ExecutionContext) + Send + Sync + 'static,
    {
        self.on_error.push(Box::new(hook));
        self
    }

    pub fn on_complete<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&ExecutionReport) + Send + Sync + 'static,
    {
        self.on_complete.push(Box::new(hook));
        self
    }

    /// Drive the workflow to completion and return the report.
    ///
    /// Never panics on step failure; every outcome lands in the report.
    pub fn execute(&mut self, ctx: &ExecutionContext) -> ExecutionReport {
        let mut report = ExecutionReport::new(self.workflow.name());
        report.dry_run = ctx.is_dry_run();
        report.start();
        report.event(
            EventKind::WorkflowStarted,
            None,
            format!("{} step(s)", self.workflow.len()),
        );
        info!(
            workflow = self.workflow.name(),
            steps = self.workflow.len(),
            dry_run = ctx.is_dry_run(),
            "orchestrated run started"
        );

        let mut cancelled = false;
        let mut failed = false;

        for index in 0..self.workflow.len() {
            if ctx.is_cancelled() {
                cancelled = true;
                report.event(EventKind::Cancelled, None, "cancelled before next step");
                break;
            }
            let name = match self.workflow.step(index) {
                Some(step) => step.name().to_string(),
                None => break,
            };

            report.event(EventKind::StepStarted, Some(name.as_str()), "");
            for hook in &self.before_step {
                hook(&name, ctx);
            }

            let result = match self.workflow.run_step(index, ctx) {
                Ok(result) => result,
                Err(e) => StepResult::failed(e),
            };

            let kind = match result.status {
                StepStatus::Completed => EventKind::StepCompleted,
                StepStatus::Skipped => EventKind::StepSkipped,
                StepStatus::Failed => EventKind::StepFailed,
            };
            report.event(kind, Some(name.as_str()), result.message.clone());
            report.record_step(&name, &result);
            for hook in &self.after_step {
                hook(&name, &result, ctx);
            }

            if result.is_cancelled() {
                cancelled = true;
                report.event(EventKind::Cancelled, Some(name.as_str()), "cancelled during step");
                break;
            }
            if let (StepStatus::Failed, Some(err)) = (result.status, result.error.as_ref()) {
                failed = true;
                error!(step = %name, error = %format!("{:#}", err), "step failed");
                for hook in &self.on_error {
                    hook(&name, err, ctx);
                }
                if self.options.error_policy == ErrorPolicy::StopOnError {
                    break;
                }
            }
        }

        report.harvest(ctx.state());
        report.status = if cancelled {
            ReportStatus::Cancelled
        } else if failed {
            ReportStatus::Failed
        } else if report.has_partial_removal() {
            ReportStatus::Partial
        } else {
            ReportStatus::Completed
        };

        if report.status == ReportStatus::Failed && self.options.rollback_on_failure {
            self.rollback(ctx, &mut report);
        }

        report.finish();
        report.event(EventKind::WorkflowFinished, None, report.status.to_string());
        info!(
            workflow = self.workflow.name(),
            status = %report.status,
            duration_ms = report.duration_ms,
            "orchestrated run finished"
        );
        for hook in &self.on_complete {
            hook(&report);
        }
        report
    }

    fn rollback(&self, ctx: &ExecutionContext, report: &mut ExecutionReport) {
        let order = self.workflow.rollback_order();
        report.event(
            EventKind::RollbackStarted,
            None,
            format!("{} step(s) to roll back", order.len()),
        );
        for step in order {
            info!(step = step.name(), "rolling back");
            if let Err(e) = step.rollback(ctx) {
                let message = format!("{}: {:#}", step.name(), e);
                warn!(step = step.name(), error = %format!("{:#}", e), "rollback failed, continuing");
                report.event(EventKind::RollbackFailed, Some(step.name()), message.clone());
                report.rollback_errors.push(message);
            }
        }
        report.rolled_back = true;
        report.reconcile_rollback(ctx.state());
        report.event(
            EventKind::RollbackFinished,
            None,
            format!("{} error(s)", report.rollback_errors.len()),
        );
    }
}
