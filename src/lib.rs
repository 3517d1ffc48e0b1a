//! Lifecycle management for proprietary GPU driver stacks on Linux.
//!
//! This crate removes (and can restore) the interrelated pieces a vendor
//! driver leaves on a host: packages, kernel modules, configuration files
//! and fallback-driver blacklists. It works across Debian, Red Hat, Arch
//! and SUSE families and keeps enough state to undo a partial run.
//!
//! - **Steps** - validatable, executable, optionally reversible units of work
//! - **Workflow / Orchestrator** - sequential execution with hooks, an event
//!   log, an error policy and a JSON report
//! - **Kernel modules** - dependency-ordered unload with retry and forced
//!   fallback, reverse-order reload
//! - **Package discovery** - distribution-aware categorization of vendor
//!   packages
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (hooks, events, error policy, report)
//!     │
//!     └── Workflow (ordered steps, completed list, rollback order)
//!             │
//!             ├── PreflightStep ──────── which, elevation
//!             ├── ModuleUnloadStep ───── kmod::KernelModuleManager
//!             ├── PackageRemovalStep ─── package::{PackageDiscovery, PackageManager}
//!             ├── ConfigCleanupStep ──── backup::BackupSession
//!             └── DriverRestoreStep ──── distro::DistroFamily (boot image tool)
//!
//! ExecutionContext ── CoreContext (state, cancellation, dry-run, executor)
//!     ├── Distribution
//!     ├── PackageManager (optional)
//!     └── ModuleDetector (optional)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use driver_lifecycle::config::LifecycleConfig;
//! use driver_lifecycle::context::{CoreContext, ExecutionContext};
//! use driver_lifecycle::distro::Distribution;
//! use driver_lifecycle::orchestrator::Orchestrator;
//! use driver_lifecycle::process::SystemExecutor;
//!
//! let config = LifecycleConfig::default();
//! let core = CoreContext::new(Arc::new(SystemExecutor::new())).with_dry_run(true);
//! let ctx = ExecutionContext::new(core, Distribution::detect()?);
//!
//! let mut orchestrator = Orchestrator::new(config.uninstall_workflow()?)
//!     .with_options(config.orchestrator_options());
//! let report = orchestrator.execute(&ctx);
//! println!("{}", report.summary());
//! ```

pub mod backup;
pub mod config;
pub mod context;
pub mod distro;
pub mod elevation;
pub mod error;
pub mod kmod;
pub mod orchestrator;
pub mod package;
pub mod process;
pub mod report;
pub mod step;
pub mod steps;
pub mod workflow;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use context::{CancellationToken, CoreContext, ExecutionContext, StateStore};
pub use distro::{DistroFamily, Distribution};
pub use error::{Cancelled, ExecError};
pub use orchestrator::{ErrorPolicy, Orchestrator, OrchestratorOptions};
pub use report::{ExecutionReport, ReportStatus, RevertedEffects};
pub use step::{Step, StepResult, StepStatus};
pub use workflow::Workflow;
