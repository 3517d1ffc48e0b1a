//! Remove vendor configuration files, with backups for rollback.
//!
//! Candidate paths are the defaults plus caller-supplied paths, optionally
//! extended by scanning the allow-listed directories for vendor-named files.
//! Removal runs `rm -f -- <path>` through the process collaborator, so every
//! path is validated first:
//!
//! - absolute
//! - no `..` anywhere
//! - no shell metacharacters (`;|&` backtick `$(){}<>!`, quotes, newline)
//! - strictly below one of the allowed roots
//!
//! Each run writes a [`BackupSession`] before anything is removed. Rollback
//! writes every recorded backup back with an elevated
//! `tee -- <path>`, after checking its digest, and keeps going past individual
//! failures.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backup::{self, BackupEntry, BackupSession};
use crate::context::{keys, ExecutionContext};
use crate::process::CommandSpec;
use crate::step::{Step, StepResult};

/// Directories configuration cleanup may touch.
pub const DEFAULT_ALLOWED_ROOTS: &[&str] = &[
    "/etc/modprobe.d",
    "/etc/modules-load.d",
    "/etc/X11",
    "/etc/dracut.conf.d",
    "/etc/OpenCL/vendors",
    "/usr/lib/modprobe.d",
    "/usr/share/X11/xorg.conf.d",
];

/// Well-known files left behind by vendor driver installs.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/etc/modprobe.d/nvidia.conf",
    "/etc/modprobe.d/nvidia-graphics-drivers.conf",
    "/etc/modules-load.d/nvidia.conf",
    "/etc/X11/xorg.conf.d/10-nvidia.conf",
    "/etc/X11/xorg.conf.d/20-nvidia.conf",
    "/etc/X11/xorg.conf",
    "/etc/dracut.conf.d/nvidia.conf",
    "/etc/OpenCL/vendors/nvidia.icd",
];

/// Directories scanned for vendor-named files.
pub const DEFAULT_SCAN_DIRS: &[&str] = &[
    "/etc/modprobe.d",
    "/etc/X11/xorg.conf.d",
    "/etc/modules-load.d",
];

/// Characters that must never reach a command line.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>', '!', '\n', '\r', '\'', '"', '\\',
];

const VENDOR_FILE_PATTERN: &str = r"(?i)nvidia|cuda";
/// Fallback-driver blacklists belong to driver restore.
const FALLBACK_BLACKLIST_PATTERN: &str = r"(?i)nouveau";

const FILE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Validate a removal path against `allowed_roots`.
pub fn validate_config_path(path: &Path, allowed_roots: &[PathBuf]) -> Result<()> {
    let Some(raw) = path.to_str() else {
        bail!("path '{}' is not valid UTF-8", path.display());
    };
    if !path.is_absolute() {
        bail!("path '{}' is not absolute", raw);
    }
    if raw.contains("..") {
        bail!("path '{}' contains '..'", raw);
    }
    if let Some(c) = raw.chars().find(|c| SHELL_METACHARACTERS.contains(c) || c.is_control()) {
        bail!("path '{}' contains forbidden character {:?}", raw.escape_debug(), c);
    }
    let rooted = allowed_roots
        .iter()
        .any(|root| path != root.as_path() && path.starts_with(root));
    if !rooted {
        bail!("path '{}' is outside the allowed directories", raw);
    }
    Ok(())
}

pub fn is_valid_config_path(path: &Path, allowed_roots: &[PathBuf]) -> bool {
    validate_config_path(path, allowed_roots).is_ok()
}

/// Removes vendor configuration files.
#[derive(Debug, Clone)]
pub struct ConfigCleanupStep {
    paths: Vec<PathBuf>,
    allowed_roots: Vec<PathBuf>,
    scan_dirs: Vec<PathBuf>,
    scan: bool,
    backup: bool,
    backup_dir: PathBuf,
}

impl ConfigCleanupStep {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect(),
            allowed_roots: DEFAULT_ALLOWED_ROOTS.iter().map(PathBuf::from).collect(),
            scan_dirs: DEFAULT_SCAN_DIRS.iter().map(PathBuf::from).collect(),
            scan: true,
            backup: true,
            backup_dir: backup_dir.into(),
        }
    }

    /// Add caller-supplied paths to the defaults.
    pub fn with_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Replace the defaults entirely.
    pub fn only_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.allowed_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scan_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.scan_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scan(mut self, scan: bool) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Deduplicated, existing candidate files, in declaration order.
    pub fn collect_candidates(&self) -> Result<Vec<PathBuf>> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        let mut push = |path: PathBuf| {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        };

        for path in &self.paths {
            push(path.clone());
        }
        if self.scan {
            for path in self.scan_vendor_files()? {
                push(path);
            }
        }

        Ok(candidates.into_iter().filter(|p| p.is_file()).collect())
    }

    fn scan_vendor_files(&self) -> Result<Vec<PathBuf>> {
        let vendor = Regex::new(VENDOR_FILE_PATTERN)?;
        let fallback = Regex::new(FALLBACK_BLACKLIST_PATTERN)?;
        let mut found = Vec::new();

        for dir in &self.scan_dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(dir).max_depth(2).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if vendor.is_match(&name) && !fallback.is_match(&name) {
                    let path = entry.into_path();
                    if is_valid_config_path(&path, &self.allowed_roots) {
                        found.push(path);
                    } else {
                        warn!(path = %path.display(), "ignoring scanned file with unsafe path");
                    }
                }
            }
        }
        Ok(found)
    }

    fn back_up(&self, ctx: &ExecutionContext, files: &[PathBuf]) -> Result<Vec<BackupEntry>> {
        let mut session = BackupSession::create(&self.backup_dir)?;
        for file in files {
            ctx.check_cancelled()?;
            session.add(file)?;
        }
        let entries = session.entries().to_vec();
        let dir = session.finish()?;
        info!(session = %dir.display(), files = entries.len(), "configuration backed up");
        ctx.state().set(keys::CONFIG_BACKUP_SESSION, dir);
        Ok(entries)
    }
}

/// Write a verified backup back through the executor, elevated like the removal.
fn restore_entry(ctx: &ExecutionContext, entry: &BackupEntry) -> Result<()> {
    let bytes = backup::read_verified(entry)?;
    if let Some(parent) = entry.original.parent().filter(|p| !p.is_dir()) {
        let mkdir = CommandSpec::new("mkdir")
            .args(["-p", "--"])
            .arg(parent.to_string_lossy())
            .elevated()
            .timeout(FILE_COMMAND_TIMEOUT);
        ctx.run_checked(&mkdir)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let tee = CommandSpec::new("tee")
        .arg("--")
        .arg(entry.original.to_string_lossy())
        .stdin(bytes)
        .elevated()
        .timeout(FILE_COMMAND_TIMEOUT);
    ctx.run_checked(&tee)
        .with_context(|| format!("restoring '{}'", entry.original.display()))?;
    debug!(path = %entry.original.display(), sha256 = %entry.sha256, "restored");
    Ok(())
}

impl Step for ConfigCleanupStep {
    fn name(&self) -> &str {
        "config-cleanup"
    }

    fn description(&self) -> &str {
        "Remove vendor configuration files"
    }

    fn validate(&self, _ctx: &ExecutionContext) -> Result<()> {
        if self.allowed_roots.is_empty() {
            bail!("no allowed configuration directories");
        }
        for root in &self.allowed_roots {
            if !root.is_absolute() {
                bail!("allowed directory '{}' is not absolute", root.display());
            }
        }
        for path in &self.paths {
            validate_config_path(path, &self.allowed_roots)?;
        }
        if self.backup && self.backup_dir.as_os_str().is_empty() {
            bail!("backups enabled but no backup directory configured");
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepResult {
        if let Err(e) = ctx.check_cancelled() {
            return StepResult::failed(e);
        }

        let files = match self.collect_candidates() {
            Ok(files) => files,
            Err(e) => return StepResult::failed(e.context("collecting configuration files")),
        };
        if files.is_empty() {
            return StepResult::skipped("no configuration files found");
        }

        if ctx.is_dry_run() {
            for file in &files {
                info!(path = %file.display(), "dry run: would remove");
            }
            return StepResult::completed(format!(
                "dry run: would remove {} configuration file(s)",
                files.len()
            ));
        }

        if self.backup {
            match self.back_up(ctx, &files) {
                Ok(entries) => ctx.state().set(keys::CONFIG_BACKUPS, entries),
                Err(e) => return StepResult::failed(e.context("backing up configuration")),
            }
        }

        let mut removed = Vec::new();
        let mut first_error = None;
        for file in &files {
            if let Err(e) = ctx.check_cancelled() {
                first_error = Some(e);
                break;
            }
            let rm = CommandSpec::new("rm")
                .args(["-f", "--"])
                .arg(file.to_string_lossy())
                .elevated()
                .timeout(FILE_COMMAND_TIMEOUT);
            match ctx
                .run_checked(&rm)
                .with_context(|| format!("removing '{}'", file.display()))
            {
                Ok(_) => {
                    debug!(path = %file.display(), "removed");
                    removed.push(file.clone());
                }
                Err(e) => {
                    warn!(path = %file.display(), error = %format!("{:#}", e), "removal failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        ctx.state().update::<Vec<PathBuf>, _>(keys::REMOVED_CONFIGS, |list| {
            for path in &removed {
                if !list.contains(path) {
                    list.push(path.clone());
                }
            }
        });

        match first_error {
            Some(e) => {
                let message = format!(
                    "removed {} of {} configuration file(s): {:#}",
                    removed.len(),
                    files.len(),
                    e
                );
                StepResult::failed_with(message, e).with_rollback(self.backup)
            }
            None => StepResult::completed(format!(
                "removed {} configuration file(s)",
                removed.len()
            ))
            .with_rollback(self.backup),
        }
    }

    fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let backups: Vec<BackupEntry> = ctx.state().get_or_default(keys::CONFIG_BACKUPS);
        if backups.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        let mut pending = Vec::new();
        for entry in &backups {
            if let Err(e) = restore_entry(ctx, entry) {
                warn!(path = %entry.original.display(), error = %format!("{:#}", e), "restore failed, continuing");
                first_error.get_or_insert(e);
                pending.push(entry.clone());
            }
        }
        info!(
            restored = backups.len() - pending.len(),
            total = backups.len(),
            "configuration restored"
        );

        // Unrestored files stay recorded for a later attempt.
        match first_error {
            Some(e) => {
                let still_removed: Vec<PathBuf> = pending.iter().map(|b| b.original.clone()).collect();
                ctx.state().update::<Vec<PathBuf>, _>(keys::REMOVED_CONFIGS, |list| {
                    list.retain(|p| still_removed.contains(p))
                });
                ctx.state().set(keys::CONFIG_BACKUPS, pending);
                Err(e)
            }
            None => {
                ctx.state().remove(keys::CONFIG_BACKUPS);
                ctx.state().remove(keys::REMOVED_CONFIGS);
                Ok(())
            }
        }
    }

    fn can_rollback(&self) -> bool {
        self.backup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreContext;
    use crate::distro::Distribution;
    use crate::error::ExecError;
    use crate::process::CommandOutput;
    use crate::step::{run_step, StepStatus};
    use crate::testing::FakeExecutor;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn roots() -> Vec<PathBuf> {
        vec![PathBuf::from("/etc/modprobe.d"), PathBuf::from("/etc/X11")]
    }

    #[test]
    fn test_path_validation() {
        let roots = roots();
        assert!(is_valid_config_path(Path::new("/etc/modprobe.d/nvidia.conf"), &roots));
        assert!(is_valid_config_path(Path::new("/etc/X11/xorg.conf.d/10-nvidia.conf"), &roots));

        assert!(!is_valid_config_path(Path::new("etc/modprobe.d/nvidia.conf"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d/../shadow"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d/a..b"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d/x;reboot"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d/$(id)"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d/a|b"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d/a\nb"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d/'q'"), &roots));
        assert!(!is_valid_config_path(Path::new("/etc/passwd"), &roots));
        // Sibling with a shared prefix is not under the root.
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d.bak/x"), &roots));
        // The root itself is not removable.
        assert!(!is_valid_config_path(Path::new("/etc/modprobe.d"), &roots));
    }

    struct Fixture {
        temp: TempDir,
        step: ConfigCleanupStep,
        exec: Arc<FakeExecutor>,
        ctx: ExecutionContext,
    }

    /// Applies `rm` and `tee` to the real filesystem.
    fn apply_file_command(spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let target = spec.args.last();
        match (spec.program.as_str(), target) {
            ("rm", Some(path)) => {
                let _ = fs::remove_file(path);
            }
            ("tee", Some(path)) => {
                fs::write(path, spec.stdin.clone().unwrap_or_default())
                    .map_err(|e| ExecError::Unspecified(e.to_string()))?;
            }
            _ => {}
        }
        Ok(CommandOutput::ok())
    }

    /// Files under `<temp>/etc`, and an executor that applies file commands.
    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let etc = temp.path().join("etc");
        for (rel, content) in files {
            let path = etc.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
        let exec = Arc::new(FakeExecutor::new().with_handler(apply_file_command));
        let step = ConfigCleanupStep::new(temp.path().join("backups"))
            .only_paths(files.iter().map(|(rel, _)| etc.join(rel)))
            .with_allowed_roots([etc.clone()])
            .with_scan_dirs([etc.join("modprobe.d")]);
        let ctx = ExecutionContext::new(CoreContext::new(exec.clone()), Distribution::default());
        Fixture {
            temp,
            step,
            exec,
            ctx,
        }
    }

    #[test]
    fn test_cleanup_then_rollback_restores_bytes() {
        let files = [
            ("modprobe.d/nvidia.conf", "options nvidia-drm modeset=1\n"),
            ("X11/xorg.conf", "Section \"Device\"\n  Driver \"nvidia\"\nEndSection\n"),
        ];
        let f = fixture(&files);

        let result = run_step(&f.step, &f.ctx);
        assert_eq!(result.status, StepStatus::Completed, "{}", result.message);
        assert!(result.can_rollback);
        for (rel, _) in &files {
            assert!(!f.temp.path().join("etc").join(rel).exists());
        }
        let removed: Vec<PathBuf> = f.ctx.state().get_or_default(keys::REMOVED_CONFIGS);
        assert_eq!(removed.len(), 2);
        let session: PathBuf = f.ctx.state().get(keys::CONFIG_BACKUP_SESSION).unwrap();
        assert!(session.join(backup::MANIFEST_FILENAME).is_file());

        f.step.rollback(&f.ctx).unwrap();
        for (rel, content) in &files {
            let restored = fs::read(f.temp.path().join("etc").join(rel)).unwrap();
            assert_eq!(restored, content.as_bytes());
        }
    }

    #[test]
    fn test_rollback_writes_each_backup_through_elevated_tee() {
        let files = [
            ("modprobe.d/nvidia.conf", "options nvidia-drm modeset=1\n"),
            ("modprobe.d/nvidia-power.conf", "options nvidia NVreg_DynamicPowerManagement=0x02\n"),
        ];
        let f = fixture(&files);
        assert_eq!(run_step(&f.step, &f.ctx).status, StepStatus::Completed);
        let before = f.exec.calls().len();

        f.step.rollback(&f.ctx).unwrap();

        let tees: Vec<CommandSpec> = f.exec.calls().split_off(before);
        assert_eq!(tees.len(), files.len());
        for (spec, (rel, content)) in tees.iter().zip(&files) {
            assert_eq!(spec.program, "tee");
            assert!(spec.elevated);
            let target = f.temp.path().join("etc").join(rel);
            assert_eq!(spec.args, vec!["--".to_string(), target.to_string_lossy().into_owned()]);
            assert_eq!(spec.stdin.as_deref(), Some(content.as_bytes()));
        }
    }

    #[test]
    fn test_rollback_skips_tampered_backup_and_restores_the_rest() {
        let files = [("modprobe.d/nvidia.conf", "a\n"), ("X11/xorg.conf", "b\n")];
        let f = fixture(&files);
        assert_eq!(run_step(&f.step, &f.ctx).status, StepStatus::Completed);
        let backups: Vec<BackupEntry> = f.ctx.state().get_or_default(keys::CONFIG_BACKUPS);
        fs::write(&backups[0].backup, "tampered").unwrap();

        let err = f.step.rollback(&f.ctx).unwrap_err();
        assert!(format!("{:#}", err).contains("does not match"));
        assert_eq!(f.exec.call_count("tee"), 1);
        assert!(!f.temp.path().join("etc/modprobe.d/nvidia.conf").exists());
        assert_eq!(fs::read(f.temp.path().join("etc/X11/xorg.conf")).unwrap(), b"b\n");
        let still_removed: Vec<PathBuf> = f.ctx.state().get_or_default(keys::REMOVED_CONFIGS);
        assert_eq!(still_removed, vec![f.temp.path().join("etc/modprobe.d/nvidia.conf")]);
    }

    #[test]
    fn test_scan_finds_vendor_files_but_not_fallback_blacklists() {
        let f = fixture(&[("modprobe.d/nvidia.conf", "x")]);
        let etc = f.temp.path().join("etc");
        fs::write(etc.join("modprobe.d/nvidia-power.conf"), "y").unwrap();
        fs::write(etc.join("modprobe.d/blacklist-nouveau.conf"), "blacklist nouveau").unwrap();
        fs::write(etc.join("modprobe.d/alsa.conf"), "z").unwrap();

        let candidates = f.step.collect_candidates().unwrap();
        let names: Vec<String> = candidates
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"nvidia.conf".to_string()));
        assert!(names.contains(&"nvidia-power.conf".to_string()));
    }

    #[test]
    fn test_nothing_to_remove_is_skipped() {
        let f = fixture(&[]);
        let step = f.step.clone().only_paths([f.temp.path().join("etc/modprobe.d/nvidia.conf")]);
        let result = run_step(&step, &f.ctx);
        assert_eq!(result.status, StepStatus::Skipped);
        assert!(f.exec.calls().is_empty());
    }

    #[test]
    fn test_unsafe_configured_path_fails_validation() {
        let f = fixture(&[("modprobe.d/nvidia.conf", "x")]);
        let step = f
            .step
            .clone()
            .with_paths([f.temp.path().join("etc/modprobe.d/x;reboot")]);
        let result = run_step(&step, &f.ctx);
        assert_eq!(result.status, StepStatus::Failed);
        assert!(f.exec.calls().is_empty());
    }

    #[test]
    fn test_removal_failure_keeps_going_and_stays_reversible() {
        let f = fixture(&[
            ("modprobe.d/nvidia.conf", "a"),
            ("modprobe.d/nvidia-drm.conf", "b"),
        ]);
        let exec = Arc::new(FakeExecutor::new().fail_when(|spec| {
            spec.program == "rm" && spec.args.iter().any(|a| a.ends_with("nvidia.conf"))
        }));
        let ctx = ExecutionContext::new(CoreContext::new(exec.clone()), Distribution::default());

        let result = run_step(&f.step, &ctx);
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.can_rollback);
        assert!(result.message.contains("removed 1 of 2"));
        assert_eq!(exec.call_count("rm"), 2);
    }

    #[test]
    fn test_without_backup_is_not_reversible() {
        let f = fixture(&[("modprobe.d/nvidia.conf", "a")]);
        let step = f.step.clone().with_backup(false);
        assert!(!step.can_rollback());
        let result = run_step(&step, &f.ctx);
        assert_eq!(result.status, StepStatus::Completed);
        assert!(!result.can_rollback);
        assert!(!f.temp.path().join("backups").exists());
    }
}
