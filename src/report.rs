//! Structured outcome of an orchestrated run.
//!
//! The orchestrator fills an [`ExecutionReport`] as it drives steps, then
//! harvests the facts steps recorded in shared state (removed packages,
//! removed configs, unloaded modules, reboot flag). After a rollback those
//! fields are re-read, so they describe the host as left; what the rollback
//! undid moves to [`ExecutionReport::reverted`]. The report serializes to
//! JSON for machines and renders a short text summary for people.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use crate::backup::now_utc_compact;
use crate::context::{keys, StateStore};
use crate::step::{StepResult, StepStatus};

/// Overall run status.
///
/// `Partial` is only reached when package removal left both removed and
/// failed packages and no step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl ReportStatus {
    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReportStatus::Pending | ReportStatus::Running)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Running => "running",
            ReportStatus::Completed => "completed",
            ReportStatus::Partial => "partial",
            ReportStatus::Failed => "failed",
            ReportStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub status: StepStatus,
    pub message: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepSummary {
    pub fn from_result(name: &str, result: &StepResult) -> Self {
        Self {
            name: name.to_string(),
            status: result.status,
            message: result.message.clone(),
            duration_ms: result.duration.as_millis() as u64,
            error: result.error.as_ref().map(|e| format!("{:#}", e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepSkipped,
    StepFailed,
    Cancelled,
    RollbackStarted,
    RollbackFailed,
    RollbackFinished,
    WorkflowFinished,
}

/// One entry of the orchestrator event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Milliseconds since the run started.
    pub at_ms: u64,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
}

/// Effects a rollback put back. Empty unless the run was rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertedEffects {
    pub removed_configs: Vec<PathBuf>,
    pub unloaded_modules: Vec<String>,
    pub driver_restored: bool,
}

impl RevertedEffects {
    pub fn is_empty(&self) -> bool {
        self.removed_configs.is_empty() && self.unloaded_modules.is_empty() && !self.driver_restored
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub workflow: String,
    pub status: ReportStatus,
    pub started_at_utc: String,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub steps: Vec<StepSummary>,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub removed_packages: Vec<String>,
    pub failed_packages: Vec<String>,
    pub removed_configs: Vec<PathBuf>,
    pub unloaded_modules: Vec<String>,
    pub reboot_required: bool,
    pub driver_restored: bool,
    pub rolled_back: bool,
    pub rollback_errors: Vec<String>,
    pub reverted: RevertedEffects,
    pub events: Vec<ExecutionEvent>,
    #[serde(skip)]
    clock: Option<Instant>,
}

impl ExecutionReport {
    /// A `Pending` report for `workflow`, stamped with the current UTC time.
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            status: ReportStatus::Pending,
            started_at_utc: now_utc_compact(),
            duration_ms: 0,
            dry_run: false,
            steps: Vec::new(),
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            failed_step: None,
            error: None,
            removed_packages: Vec::new(),
            failed_packages: Vec::new(),
            removed_configs: Vec::new(),
            unloaded_modules: Vec::new(),
            reboot_required: false,
            driver_restored: false,
            rolled_back: false,
            rollback_errors: Vec::new(),
            reverted: RevertedEffects::default(),
            events: Vec::new(),
            clock: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.clock = Some(Instant::now());
        self.status = ReportStatus::Running;
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.clock
            .map(|c| c.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub(crate) fn finish(&mut self) {
        self.duration_ms = self.elapsed_ms();
    }

    pub(crate) fn event(&mut self, kind: EventKind, step: Option<&str>, message: impl Into<String>) {
        let at_ms = self.elapsed_ms();
        self.events.push(ExecutionEvent {
            at_ms,
            kind,
            step: step.map(str::to_string),
            message: message.into(),
        });
    }

    pub(crate) fn record_step(&mut self, name: &str, result: &StepResult) {
        match result.status {
            StepStatus::Completed => self.completed_steps.push(name.to_string()),
            StepStatus::Skipped => self.skipped_steps.push(name.to_string()),
            StepStatus::Failed => {
                // First failure wins under continue-on-error.
                if self.failed_step.is_none() {
                    self.failed_step = Some(name.to_string());
                    self.error = result.error.as_ref().map(|e| format!("{:#}", e));
                }
            }
        }
        self.steps.push(StepSummary::from_result(name, result));
    }

    /// Copy the facts steps left in shared state.
    pub(crate) fn harvest(&mut self, state: &StateStore) {
        self.removed_packages = state.get_or_default(keys::REMOVED_PACKAGES);
        self.failed_packages = state.get_or_default(keys::FAILED_PACKAGES);
        self.removed_configs = state.get_or_default(keys::REMOVED_CONFIGS);
        self.unloaded_modules = state.get_or_default(keys::UNLOADED_MODULES);
        self.reboot_required = state.get_or_default(keys::REBOOT_REQUIRED);
        self.driver_restored = state.get_or_default(keys::DRIVER_RESTORED);
    }

    /// Re-read state after a rollback and move whatever it undid into
    /// [`Self::reverted`]. A step whose rollback failed keeps its facts.
    pub(crate) fn reconcile_rollback(&mut self, state: &StateStore) {
        let configs_before = std::mem::take(&mut self.removed_configs);
        let modules_before = std::mem::take(&mut self.unloaded_modules);
        let restored_before = self.driver_restored;
        self.harvest(state);

        let removed_configs = configs_before
            .into_iter()
            .filter(|p| !self.removed_configs.contains(p))
            .collect();
        let unloaded_modules = modules_before
            .into_iter()
            .filter(|m| !self.unloaded_modules.contains(m))
            .collect();
        self.reverted = RevertedEffects {
            removed_configs,
            unloaded_modules,
            driver_restored: restored_before && !self.driver_restored,
        };
    }

    /// True when removal left both removed and failed packages.
    pub fn has_partial_removal(&self) -> bool {
        !self.removed_packages.is_empty() && !self.failed_packages.is_empty()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ReportStatus::Completed | ReportStatus::Partial)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing execution report")
    }

    /// Multi-line human summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} {}{} in {} ms\n",
            self.workflow,
            self.status,
            if self.dry_run { " (dry run)" } else { "" },
            self.duration_ms
        );
        for step in &self.steps {
            out.push_str(&format!("  [{}] {}: {}\n", step.status, step.name, step.message));
        }
        if !self.removed_packages.is_empty() {
            out.push_str(&format!("  removed packages: {}\n", self.removed_packages.join(", ")));
        }
        if !self.failed_packages.is_empty() {
            out.push_str(&format!("  failed packages: {}\n", self.failed_packages.join(", ")));
        }
        if !self.removed_configs.is_empty() {
            out.push_str(&format!("  removed configs: {}\n", self.removed_configs.len()));
        }
        if let (Some(step), Some(error)) = (&self.failed_step, &self.error) {
            out.push_str(&format!("  error in {}: {}\n", step, error));
        }
        if self.rolled_back {
            if !self.reverted.is_empty() {
                out.push_str(&format!(
                    "  reverted: {} config(s), {} module(s){}\n",
                    self.reverted.removed_configs.len(),
                    self.reverted.unloaded_modules.len(),
                    if self.reverted.driver_restored { ", fallback driver" } else { "" }
                ));
            }
            if self.rollback_errors.is_empty() {
                out.push_str("  rolled back\n");
            } else {
                out.push_str(&format!(
                    "  rollback incomplete: {}\n",
                    self.rollback_errors.join("; ")
                ));
            }
        }
        if self.reboot_required {
            out.push_str("  reboot required\n");
        }
        out
    }
}
