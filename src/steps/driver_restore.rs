//! Bring back the open-source fallback driver after the vendor driver is gone.
//!
//! Three independently toggled actions, in order:
//!
//! 1. remove the fallback-driver blacklist files,
//! 2. regenerate the boot image with the family's tool,
//! 3. load the fallback module.
//!
//! If regeneration fails, the blacklists removed in (1) are written back
//! right away before the step fails. A fallback that is neither blacklisted
//! nor present in the boot image is the worst state to leave a host in. A
//! failed fallback load is only a warning; a reboot normally fixes it.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::config_cleanup::validate_config_path;
use crate::context::{keys, ExecutionContext};
use crate::kmod::{is_valid_module_name, KernelModuleManager, MODULE_COMMAND_TIMEOUT};
use crate::process::CommandSpec;
use crate::step::{Step, StepResult};

pub const DEFAULT_FALLBACK_MODULE: &str = "nouveau";

pub const DEFAULT_BLACKLIST_PATHS: &[&str] = &[
    "/etc/modprobe.d/blacklist-nouveau.conf",
    "/etc/modprobe.d/nvidia-installer-disable-nouveau.conf",
    "/usr/lib/modprobe.d/nvidia-installer-disable-nouveau.conf",
    "/lib/modprobe.d/nvidia-installer-disable-nouveau.conf",
];

pub const BLACKLIST_ROOTS: &[&str] = &["/etc/modprobe.d", "/usr/lib/modprobe.d", "/lib/modprobe.d"];

/// Initramfs generation can take minutes per kernel.
const BOOT_IMAGE_TIMEOUT: Duration = Duration::from_secs(900);
const FILE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A file removed by this step, kept verbatim for restoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedFile {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct DriverRestoreStep {
    remove_blacklist: bool,
    regenerate_boot_image: bool,
    load_fallback: bool,
    fallback_module: String,
    blacklist_paths: Vec<PathBuf>,
    blacklist_roots: Vec<PathBuf>,
    modules: KernelModuleManager,
}

impl Default for DriverRestoreStep {
    fn default() -> Self {
        Self {
            remove_blacklist: true,
            regenerate_boot_image: true,
            load_fallback: true,
            fallback_module: DEFAULT_FALLBACK_MODULE.to_string(),
            blacklist_paths: DEFAULT_BLACKLIST_PATHS.iter().map(PathBuf::from).collect(),
            blacklist_roots: BLACKLIST_ROOTS.iter().map(PathBuf::from).collect(),
            modules: KernelModuleManager::new(),
        }
    }
}

impl DriverRestoreStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remove_blacklist(mut self, enabled: bool) -> Self {
        self.remove_blacklist = enabled;
        self
    }

    pub fn with_regenerate_boot_image(mut self, enabled: bool) -> Self {
        self.regenerate_boot_image = enabled;
        self
    }

    pub fn with_load_fallback(mut self, enabled: bool) -> Self {
        self.load_fallback = enabled;
        self
    }

    pub fn with_fallback_module(mut self, module: impl Into<String>) -> Self {
        self.fallback_module = module.into();
        self
    }

    pub fn with_blacklist_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.blacklist_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blacklist_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.blacklist_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    fn remove_blacklists(&self, ctx: &ExecutionContext) -> Result<Vec<RemovedFile>> {
        let mut removed = Vec::new();
        for path in self.blacklist_paths.iter().filter(|p| p.is_file()) {
            ctx.check_cancelled()?;
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading blacklist '{}'", path.display()))?;
            let rm = CommandSpec::new("rm")
                .args(["-f", "--"])
                .arg(path.to_string_lossy())
                .elevated()
                .timeout(FILE_COMMAND_TIMEOUT);
            ctx.run_checked(&rm)
                .with_context(|| format!("removing blacklist '{}'", path.display()))?;
            info!(path = %path.display(), "fallback blacklist removed");
            let file = RemovedFile {
                path: path.clone(),
                content,
            };
            ctx.state()
                .update::<Vec<RemovedFile>, _>(keys::REMOVED_BLACKLISTS, |list| list.push(file.clone()));
            removed.push(file);
        }
        Ok(removed)
    }

    fn regenerate(&self, ctx: &ExecutionContext) -> Result<()> {
        let family = ctx.distribution().family;
        let Some((program, args)) = family.boot_image_command() else {
            bail!("no boot image tool known for distribution family '{}'", family);
        };
        let cmd = CommandSpec::new(program)
            .args(args.iter().copied())
            .elevated()
            .timeout(BOOT_IMAGE_TIMEOUT);
        ctx.run_checked(&cmd)
            .with_context(|| format!("regenerating boot image with {}", program))?;
        Ok(())
    }
}

/// Write removed files back through the executor. Continues past failures.
fn restore_files(ctx: &ExecutionContext, files: &[RemovedFile]) -> Result<()> {
    let mut first_error = None;
    for file in files {
        let tee = CommandSpec::new("tee")
            .arg("--")
            .arg(file.path.to_string_lossy())
            .stdin(file.content.as_bytes().to_vec())
            .elevated()
            .timeout(FILE_COMMAND_TIMEOUT);
        match ctx
            .run_checked(&tee)
            .with_context(|| format!("restoring '{}'", file.path.display()))
        {
            Ok(_) => info!(path = %file.path.display(), "blacklist restored"),
            Err(e) => {
                warn!(path = %file.path.display(), error = %format!("{:#}", e), "restore failed, continuing");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl Step for DriverRestoreStep {
    fn name(&self) -> &str {
        "driver-restore"
    }

    fn description(&self) -> &str {
        "Restore the open-source fallback driver"
    }

    fn validate(&self, _ctx: &ExecutionContext) -> Result<()> {
        if self.load_fallback && !is_valid_module_name(&self.fallback_module) {
            bail!("invalid fallback module name '{}'", self.fallback_module);
        }
        if self.remove_blacklist {
            for path in &self.blacklist_paths {
                validate_config_path(path, &self.blacklist_roots)?;
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepResult {
        if let Err(e) = ctx.check_cancelled() {
            return StepResult::failed(e);
        }
        if !self.remove_blacklist && !self.regenerate_boot_image && !self.load_fallback {
            return StepResult::skipped("all restore actions disabled");
        }

        if ctx.is_dry_run() {
            let mut plan = Vec::new();
            if self.remove_blacklist {
                let present = self.blacklist_paths.iter().filter(|p| p.is_file()).count();
                plan.push(format!("remove {} blacklist file(s)", present));
            }
            if self.regenerate_boot_image {
                plan.push("regenerate boot image".to_string());
            }
            if self.load_fallback {
                plan.push(format!("load {}", self.fallback_module));
            }
            info!(plan = ?plan, "dry run: driver restore");
            return StepResult::completed(format!("dry run: would {}", plan.join(", ")));
        }

        let removed = if self.remove_blacklist {
            match self.remove_blacklists(ctx) {
                Ok(removed) => removed,
                Err(e) => return StepResult::failed(e).with_rollback(true),
            }
        } else {
            Vec::new()
        };

        let mut reboot_required = false;
        if self.regenerate_boot_image {
            if let Err(e) = ctx.check_cancelled() {
                return StepResult::failed(e).with_rollback(!removed.is_empty());
            }
            match self.regenerate(ctx) {
                Ok(()) => {
                    ctx.state().set(keys::BOOT_IMAGE_REGENERATED, true);
                    reboot_required = true;
                }
                Err(e) => {
                    if !removed.is_empty() {
                        warn!("boot image regeneration failed, restoring blacklists");
                        match restore_files(ctx, &removed) {
                            Ok(()) => {
                                ctx.state().remove(keys::REMOVED_BLACKLISTS);
                            }
                            Err(restore_err) => {
                                let e = e.context(format!(
                                    "restoring blacklists also failed: {:#}",
                                    restore_err
                                ));
                                return StepResult::failed(e).with_rollback(true);
                            }
                        }
                    }
                    return StepResult::failed(e);
                }
            }
        }

        let mut message = Vec::new();
        if !removed.is_empty() {
            message.push(format!("removed {} blacklist file(s)", removed.len()));
        }
        if self.regenerate_boot_image {
            message.push("boot image regenerated".to_string());
        }

        if self.load_fallback {
            if let Err(e) = ctx.check_cancelled() {
                return StepResult::failed(e).with_rollback(true);
            }
            match self.modules.load(ctx, &self.fallback_module) {
                Ok(()) => {
                    ctx.state().set(keys::FALLBACK_LOADED, true);
                    message.push(format!("{} loaded", self.fallback_module));
                }
                Err(e) => {
                    warn!(module = %self.fallback_module, error = %format!("{:#}", e), "fallback module not loaded; reboot to finish");
                    reboot_required = true;
                    message.push(format!("{} will load after reboot", self.fallback_module));
                }
            }
        }

        ctx.state().set(keys::DRIVER_RESTORED, true);
        if reboot_required {
            ctx.state().set(keys::REBOOT_REQUIRED, true);
        }
        StepResult::completed(message.join("; ")).with_rollback(true)
    }

    fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let mut first_error: Option<anyhow::Error> = None;

        if ctx.state().get_or_default::<bool>(keys::FALLBACK_LOADED) {
            let unload = CommandSpec::new("modprobe")
                .args(["-r", self.fallback_module.as_str()])
                .elevated()
                .timeout(MODULE_COMMAND_TIMEOUT);
            if let Err(e) = ctx.run_checked(&unload) {
                warn!(module = %self.fallback_module, error = %format!("{:#}", e), "could not unload fallback");
                first_error.get_or_insert(e);
            }
            ctx.state().remove(keys::FALLBACK_LOADED);
        }

        let removed: Vec<RemovedFile> = ctx.state().get_or_default(keys::REMOVED_BLACKLISTS);
        if !removed.is_empty() {
            if let Err(e) = restore_files(ctx, &removed) {
                first_error.get_or_insert(e);
            }
            ctx.state().remove(keys::REMOVED_BLACKLISTS);

            if ctx.state().get_or_default::<bool>(keys::BOOT_IMAGE_REGENERATED) {
                if let Err(e) = self.regenerate(ctx) {
                    first_error.get_or_insert(e);
                }
            }
        }
        ctx.state().remove(keys::BOOT_IMAGE_REGENERATED);

        match first_error {
            Some(e) => Err(e.context("driver restore rollback incomplete")),
            None => {
                ctx.state().remove(keys::DRIVER_RESTORED);
                Ok(())
            }
        }
    }

    fn can_rollback(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreContext;
    use crate::distro::{DistroFamily, Distribution};
    use crate::process::CommandOutput;
    use crate::step::{run_step, StepStatus};
    use crate::testing::FakeExecutor;
    use std::sync::Arc;
    use tempfile::TempDir;

    const BLACKLIST: &str = "blacklist nouveau\noptions nouveau modeset=0\n";

    /// A blacklist under a temp modprobe.d and an executor that really runs
    /// `rm`/`tee` against it.
    fn fixture(exec: FakeExecutor) -> (TempDir, DriverRestoreStep, Arc<FakeExecutor>, ExecutionContext) {
        let temp = TempDir::new().unwrap();
        let modprobe_d = temp.path().join("modprobe.d");
        fs::create_dir_all(&modprobe_d).unwrap();
        fs::write(modprobe_d.join("blacklist-nouveau.conf"), BLACKLIST).unwrap();

        let step = DriverRestoreStep::new()
            .with_blacklist_paths([modprobe_d.join("blacklist-nouveau.conf")])
            .with_blacklist_roots([modprobe_d]);
        let exec = Arc::new(exec);
        let ctx = ExecutionContext::new(
            CoreContext::new(exec.clone()),
            Distribution::from_family(DistroFamily::Debian),
        );
        (temp, step, exec, ctx)
    }

    fn file_executor() -> FakeExecutor {
        FakeExecutor::new().with_handler(|spec| {
            match spec.program.as_str() {
                "rm" => {
                    let _ = fs::remove_file(spec.args.last().unwrap());
                }
                "tee" => {
                    fs::write(spec.args.last().unwrap(), spec.stdin.clone().unwrap_or_default())
                        .unwrap();
                }
                _ => {}
            }
            Ok(CommandOutput::ok())
        })
    }

    fn blacklist_path(temp: &TempDir) -> PathBuf {
        temp.path().join("modprobe.d/blacklist-nouveau.conf")
    }

    #[test]
    fn test_full_restore() {
        let (temp, step, exec, ctx) = fixture(file_executor());
        let result = run_step(&step, &ctx);
        assert_eq!(result.status, StepStatus::Completed, "{}", result.message);
        assert!(!blacklist_path(&temp).exists());

        let programs: Vec<String> = exec.calls().into_iter().map(|c| c.display()).collect();
        assert_eq!(programs[1], "update-initramfs -u -k all");
        assert_eq!(programs[2], "modprobe nouveau");
        assert!(ctx.state().get_or_default::<bool>(keys::DRIVER_RESTORED));
        assert!(ctx.state().get_or_default::<bool>(keys::REBOOT_REQUIRED));
        assert!(ctx.state().get_or_default::<bool>(keys::FALLBACK_LOADED));
    }

    #[test]
    fn test_boot_image_failure_restores_blacklist_immediately() {
        let exec = file_executor().fail_when(|spec| spec.program == "update-initramfs");
        let (temp, step, exec, ctx) = fixture(exec);

        let result = run_step(&step, &ctx);
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.message.contains("regenerating boot image"));
        assert_eq!(fs::read_to_string(blacklist_path(&temp)).unwrap(), BLACKLIST);
        assert_eq!(exec.call_count("modprobe"), 0);
        assert!(!ctx.state().contains(keys::REMOVED_BLACKLISTS));
        assert!(!ctx.state().contains(keys::DRIVER_RESTORED));
    }

    #[test]
    fn test_fallback_load_failure_is_a_warning() {
        let exec = file_executor().fail_when(|spec| spec.program == "modprobe");
        let (_temp, step, _exec, ctx) = fixture(exec);

        let result = run_step(&step, &ctx);
        assert_eq!(result.status, StepStatus::Completed);
        assert!(result.message.contains("after reboot"));
        assert!(ctx.state().get_or_default::<bool>(keys::REBOOT_REQUIRED));
        assert!(!ctx.state().get_or_default::<bool>(keys::FALLBACK_LOADED));
    }

    #[test]
    fn test_rollback_restores_blacklist_and_unloads_fallback() {
        let (temp, step, exec, ctx) = fixture(file_executor());
        run_step(&step, &ctx);
        step.rollback(&ctx).unwrap();

        assert_eq!(fs::read_to_string(blacklist_path(&temp)).unwrap(), BLACKLIST);
        let calls: Vec<String> = exec.calls().into_iter().map(|c| c.display()).collect();
        assert!(calls.contains(&"modprobe -r nouveau".to_string()));
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("update-initramfs")).count(),
            2
        );
        assert!(!ctx.state().contains(keys::DRIVER_RESTORED));
    }

    #[test]
    fn test_unknown_family_fails_regeneration() {
        let (_temp, step, _exec, _ctx) = fixture(file_executor());
        let exec = Arc::new(file_executor());
        let ctx = ExecutionContext::new(CoreContext::new(exec), Distribution::default());
        let result = run_step(&step.with_remove_blacklist(false), &ctx);
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.message.contains("no boot image tool"));
    }

    #[test]
    fn test_validation() {
        let ctx = ExecutionContext::new(
            CoreContext::new(Arc::new(FakeExecutor::new())),
            Distribution::default(),
        );
        assert!(DriverRestoreStep::new().validate(&ctx).is_ok());
        assert!(DriverRestoreStep::new()
            .with_fallback_module("nouveau;reboot")
            .validate(&ctx)
            .is_err());
        assert!(DriverRestoreStep::new()
            .with_blacklist_paths(["/etc/shadow"])
            .validate(&ctx)
            .is_err());
        assert_eq!(
            run_step(
                &DriverRestoreStep::new()
                    .with_remove_blacklist(false)
                    .with_regenerate_boot_image(false)
                    .with_load_fallback(false),
                &ctx
            )
            .status,
            StepStatus::Skipped
        );
    }
}
