//! Host checks before anything is touched.
//!
//! Verifies the tools later steps shell out to are installed, and records
//! privilege and secure boot status for the report.
//!
//! # Example
//!
//! ```rust
//! use driver_lifecycle::distro::DistroFamily;
//! use driver_lifecycle::steps::preflight::{check_required_tools, required_tools};
//!
//! let tools = required_tools(DistroFamily::Debian);
//! if let Err(e) = check_required_tools(&tools, |t| which::which(t).is_ok()) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::{keys, ExecutionContext};
use crate::distro::DistroFamily;
use crate::elevation::effective_uid_is_root;
use crate::step::{Step, StepResult};

/// `(command, package)` pairs every family needs.
pub const COMMON_TOOLS: &[(&str, &str)] = &[
    ("modprobe", "kmod"),
    ("rmmod", "kmod"),
    ("rm", "coreutils"),
    ("tee", "coreutils"),
];

/// Tools needed on `family`: the common set plus package manager and boot
/// image tool.
pub fn required_tools(family: DistroFamily) -> Vec<(String, String)> {
    let mut tools: Vec<(String, String)> = COMMON_TOOLS
        .iter()
        .map(|(t, p)| (t.to_string(), p.to_string()))
        .collect();
    let extra: &[(&str, &str)] = match family {
        DistroFamily::Debian => &[("dpkg-query", "dpkg"), ("apt-get", "apt")],
        DistroFamily::RedHat => &[("rpm", "rpm"), ("dnf", "dnf")],
        DistroFamily::Suse => &[("rpm", "rpm"), ("zypper", "zypper")],
        DistroFamily::Arch => &[("pacman", "pacman")],
        DistroFamily::Unknown => &[],
    };
    tools.extend(extra.iter().map(|(t, p)| (t.to_string(), p.to_string())));
    if let Some((program, _)) = family.boot_image_command() {
        let package = match program {
            "update-initramfs" => "initramfs-tools",
            "mkinitcpio" => "mkinitcpio",
            _ => "dracut",
        };
        tools.push((program.to_string(), package.to_string()));
    }
    tools
}

/// Fail with every missing tool listed, or `Ok(())` if all are found.
pub fn check_required_tools<F>(tools: &[(String, String)], exists: F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    let missing: Vec<&(String, String)> = tools.iter().filter(|(t, _)| !exists(t)).collect();
    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
    Ok(())
}

type ToolLookup = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Read-only host checks. Never reversible because it changes nothing.
#[derive(Clone)]
pub struct PreflightStep {
    extra_tools: Vec<(String, String)>,
    require_privileges: bool,
    lookup: ToolLookup,
}

impl Default for PreflightStep {
    fn default() -> Self {
        Self {
            extra_tools: Vec::new(),
            require_privileges: true,
            lookup: Arc::new(|tool| which::which(tool).is_ok()),
        }
    }
}

impl PreflightStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, command: impl Into<String>, package: impl Into<String>) -> Self {
        self.extra_tools.push((command.into(), package.into()));
        self
    }

    pub fn with_require_privileges(mut self, require: bool) -> Self {
        self.require_privileges = require;
        self
    }

    /// Replace the `which` lookup.
    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.lookup = Arc::new(lookup);
        self
    }

    fn tools(&self, family: DistroFamily) -> Vec<(String, String)> {
        let mut tools = required_tools(family);
        tools.extend(self.extra_tools.iter().cloned());
        tools
    }
}

impl std::fmt::Debug for PreflightStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreflightStep")
            .field("extra_tools", &self.extra_tools)
            .field("require_privileges", &self.require_privileges)
            .finish()
    }
}

impl Step for PreflightStep {
    fn name(&self) -> &str {
        "preflight"
    }

    fn description(&self) -> &str {
        "Check host tools and privileges"
    }

    fn validate(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepResult {
        if let Err(e) = ctx.check_cancelled() {
            return StepResult::failed(e);
        }

        let tools = self.tools(ctx.distribution().family);
        if let Err(e) = check_required_tools(&tools, |t| (self.lookup)(t)) {
            return StepResult::failed(e);
        }

        let privileged = match ctx.elevator() {
            Some(elevator) => elevator.is_privileged(),
            None => effective_uid_is_root(),
        };
        ctx.state().set(keys::PRIVILEGED, privileged);
        if !privileged && ctx.elevator().is_none() && self.require_privileges && !ctx.is_dry_run() {
            return StepResult::failed(anyhow::anyhow!(
                "not running as root and no elevation helper configured"
            ));
        }

        let secure_boot = match ctx.module_detector() {
            Some(detector) => detector.secure_boot_enabled().unwrap_or_else(|e| {
                warn!(error = %format!("{:#}", e), "could not read secure boot state");
                None
            }),
            None => None,
        };
        if let Some(enabled) = secure_boot {
            ctx.state().set(keys::SECURE_BOOT, enabled);
            if enabled {
                warn!("secure boot is enabled; unsigned fallback modules will not load");
            }
        }

        info!(
            tools = tools.len(),
            privileged,
            secure_boot = ?secure_boot,
            distro = %ctx.distribution().family,
            "preflight passed"
        );
        StepResult::completed(format!("{} host tools present", tools.len()))
    }

    fn rollback(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreContext;
    use crate::distro::Distribution;
    use crate::elevation::SudoElevator;
    use crate::step::{run_step, StepStatus};
    use crate::testing::{FakeExecutor, FakeModuleDetector};

    fn ctx(family: DistroFamily) -> ExecutionContext {
        ExecutionContext::new(
            CoreContext::new(Arc::new(FakeExecutor::new()))
                .with_elevator(Arc::new(SudoElevator::privileged())),
            Distribution::from_family(family),
        )
    }

    #[test]
    fn test_required_tools_per_family() {
        let debian: Vec<String> = required_tools(DistroFamily::Debian)
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert!(debian.contains(&"apt-get".to_string()));
        assert!(debian.contains(&"update-initramfs".to_string()));

        let arch: Vec<String> = required_tools(DistroFamily::Arch)
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert!(arch.contains(&"mkinitcpio".to_string()));
        assert!(!arch.contains(&"dracut".to_string()));
    }

    #[test]
    fn test_check_required_tools_lists_missing() {
        let tools = vec![
            ("ls".to_string(), "coreutils".to_string()),
            ("dracut".to_string(), "dracut".to_string()),
        ];
        let err = check_required_tools(&tools, |t| t == "ls").unwrap_err();
        assert!(err.to_string().contains("dracut (install: dracut)"));
        assert!(!err.to_string().contains("ls (install"));
    }

    #[test]
    fn test_check_required_tools_with_which() {
        let tools = vec![("sh".to_string(), "dash".to_string())];
        assert!(check_required_tools(&tools, |t| which::which(t).is_ok()).is_ok());
    }

    #[test]
    fn test_missing_tool_fails_step() {
        let step = PreflightStep::new().with_lookup(|tool| tool != "dracut");
        let result = run_step(&step, &ctx(DistroFamily::RedHat));
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.message.contains("dracut"));
    }

    #[test]
    fn test_records_privilege_and_secure_boot() {
        let ctx = ctx(DistroFamily::Debian)
            .with_module_detector(Arc::new(FakeModuleDetector::new().with_secure_boot(Some(true))));
        let step = PreflightStep::new().with_lookup(|_| true);

        let result = run_step(&step, &ctx);
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(ctx.state().get::<bool>(keys::PRIVILEGED), Some(true));
        assert_eq!(ctx.state().get::<bool>(keys::SECURE_BOOT), Some(true));
        assert!(!step.can_rollback());
    }
}
