//! Kernel module management: load state, unload with retry, reload.
//!
//! The module table is re-read on every query and never cached; another
//! process (or the unload we just issued) may change it at any time.
//!
//! # Unload algorithm
//!
//! Modules are unloaded dependents-first (`nvidia_drm` before `nvidia`). When
//! `modprobe -r` fails:
//!
//! 1. If the module is not in use, the failure is final for that module.
//! 2. If it is in use, retry up to [`RetryPolicy::max_retries`] times with a
//!    fixed delay, checking cancellation before each attempt.
//! 3. If still failing and forcing is permitted, `rmmod -f` is the last resort.
//!
//! Whatever happens, [`UnloadOutcome::unloaded`] lists exactly the modules
//! that were removed, so a rollback reloads only those.

pub mod sysfs;
pub mod table;

pub use sysfs::SysfsModuleDetector;
pub use table::{is_valid_module_name, parse_module_line, parse_module_table, ModuleInfo, ModuleState};

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::CoreContext;
use crate::process::CommandSpec;

pub const PROC_MODULES_PATH: &str = "/proc/modules";
pub const SYS_MODULE_PATH: &str = "/sys/module";

/// Per-command timeout for modprobe/rmmod.
pub const MODULE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Vendor modules in the order a user would list them. Unload order is
/// derived from the live table, not from this list.
pub const DEFAULT_VENDOR_MODULES: &[&str] = &[
    "nvidia_drm",
    "nvidia_modeset",
    "nvidia_uvm",
    "nvidia_peermem",
    "nvidia",
];

/// Module introspection collaborator.
///
/// Optional: without one, the manager parses the module table directly.
pub trait ModuleDetector: Send + Sync {
    fn is_loaded(&self, name: &str) -> Result<bool>;

    fn loaded_modules(&self) -> Result<Vec<String>>;

    /// `Ok(None)` when secure boot status cannot be determined (e.g. BIOS boot).
    fn secure_boot_enabled(&self) -> Result<Option<bool>> {
        Ok(None)
    }

    fn headers_installed(&self, kernel_release: &str) -> bool {
        let _ = kernel_release;
        false
    }
}

/// Bounded retry for unloading an in-use module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// How a module ended up unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadMethod {
    Normal,
    Forced,
}

/// Result of unloading a set of modules.
#[derive(Debug, Default)]
pub struct UnloadOutcome {
    /// Modules actually removed, in unload order.
    pub unloaded: Vec<String>,
    /// Subset of `unloaded` that needed `rmmod -f`.
    pub forced: Vec<String>,
    /// Requested modules that were not loaded to begin with.
    pub not_loaded: Vec<String>,
    /// First module that could not be unloaded and why. Stops the sequence.
    pub error: Option<anyhow::Error>,
}

impl UnloadOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(crate::error::is_cancelled)
    }
}

/// Reads module state and drives modprobe/rmmod.
#[derive(Clone)]
pub struct KernelModuleManager {
    proc_modules: PathBuf,
    sys_module: PathBuf,
    detector: Option<Arc<dyn ModuleDetector>>,
    retry: RetryPolicy,
    allow_force: bool,
}

impl Default for KernelModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelModuleManager {
    pub fn new() -> Self {
        Self {
            proc_modules: PathBuf::from(PROC_MODULES_PATH),
            sys_module: PathBuf::from(SYS_MODULE_PATH),
            detector: None,
            retry: RetryPolicy::default(),
            allow_force: false,
        }
    }

    /// Read the module table and refcounts from alternate locations.
    pub fn with_paths(mut self, proc_modules: impl Into<PathBuf>, sys_module: impl Into<PathBuf>) -> Self {
        self.proc_modules = proc_modules.into();
        self.sys_module = sys_module.into();
        self
    }

    pub fn with_detector(mut self, detector: Option<Arc<dyn ModuleDetector>>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_force(mut self, allow_force: bool) -> Self {
        self.allow_force = allow_force;
        self
    }

    pub fn proc_modules_path(&self) -> &Path {
        &self.proc_modules
    }

    /// Parse the live module table.
    pub fn list(&self) -> Result<Vec<ModuleInfo>> {
        let content = fs::read_to_string(&self.proc_modules).with_context(|| {
            format!("reading module table '{}'", self.proc_modules.display())
        })?;
        Ok(parse_module_table(&content))
    }

    pub fn get(&self, name: &str) -> Result<Option<ModuleInfo>> {
        Ok(self.list()?.into_iter().find(|m| m.name == name))
    }

    pub fn is_loaded(&self, name: &str) -> Result<bool> {
        if let Some(detector) = &self.detector {
            return detector.is_loaded(name);
        }
        Ok(self.get(name)?.is_some())
    }

    /// Reference count from `/sys/module/<name>/refcnt`, else the table column.
    pub fn use_count(&self, name: &str) -> Result<u32> {
        let refcnt_path = self.sys_module.join(name).join("refcnt");
        if let Ok(raw) = fs::read_to_string(&refcnt_path) {
            if let Ok(count) = raw.trim().parse::<u32>() {
                return Ok(count);
            }
            debug!(path = %refcnt_path.display(), "unparseable refcnt, using module table");
        }
        Ok(self.get(name)?.map(|m| m.use_count).unwrap_or(0))
    }

    pub fn is_in_use(&self, name: &str) -> Result<bool> {
        Ok(self.use_count(name)? > 0)
    }

    /// Filter `requested` to loaded modules and order them dependents-first.
    ///
    /// Returns `(order, not_loaded)`.
    pub fn plan_unload(&self, requested: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        let table = self.list()?;
        let mut loaded = Vec::new();
        let mut not_loaded = Vec::new();
        for name in requested {
            let present = match &self.detector {
                Some(detector) => detector.is_loaded(name)?,
                None => table.iter().any(|m| &m.name == name),
            };
            if present {
                if !loaded.contains(name) {
                    loaded.push(name.clone());
                }
            } else {
                not_loaded.push(name.clone());
            }
        }
        Ok((unload_order(&table, &loaded), not_loaded))
    }

    /// Unload `requested` in dependency order, stopping at the first failure.
    pub fn unload_all(&self, core: &CoreContext, requested: &[String]) -> UnloadOutcome {
        let mut outcome = UnloadOutcome::default();

        let (order, not_loaded) = match self.plan_unload(requested) {
            Ok(plan) => plan,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.not_loaded = not_loaded;

        for name in order {
            if let Err(e) = core.check_cancelled() {
                outcome.error = Some(e);
                break;
            }
            match self.unload_one(core, &name) {
                Ok(method) => {
                    info!(module = %name, ?method, "module unloaded");
                    if method == UnloadMethod::Forced {
                        outcome.forced.push(name.clone());
                    }
                    outcome.unloaded.push(name);
                }
                Err(e) => {
                    warn!(module = %name, error = %e, "module unload failed");
                    outcome.error = Some(e.context(format!("unloading module '{}'", name)));
                    break;
                }
            }
        }

        outcome
    }

    /// Unload one module with the retry/force policy described at module level.
    pub fn unload_one(&self, core: &CoreContext, name: &str) -> Result<UnloadMethod> {
        let unload = CommandSpec::new("modprobe")
            .args(["-r", name])
            .elevated()
            .timeout(MODULE_COMMAND_TIMEOUT);

        let mut last_error = match core.run_checked(&unload) {
            Ok(_) => return Ok(UnloadMethod::Normal),
            Err(e) => e,
        };

        let in_use = self.is_in_use(name).unwrap_or_else(|e| {
            debug!(module = %name, error = %e, "could not read use count, assuming in use");
            true
        });
        if !in_use {
            return Err(last_error.context(format!("module '{}' is not in use; not retrying", name)));
        }

        for attempt in 1..=self.retry.max_retries {
            core.check_cancelled()?;
            debug!(module = %name, attempt, max = self.retry.max_retries, "module busy, retrying");
            thread::sleep(self.retry.delay);
            core.check_cancelled()?;
            match core.run_checked(&unload) {
                Ok(_) => return Ok(UnloadMethod::Normal),
                Err(e) => last_error = e,
            }
        }

        if self.allow_force || core.is_force() {
            core.check_cancelled()?;
            warn!(module = %name, "module still busy, forcing removal");
            let force = CommandSpec::new("rmmod")
                .args(["-f", name])
                .elevated()
                .timeout(MODULE_COMMAND_TIMEOUT);
            core.run_checked(&force)
                .with_context(|| format!("forced removal of module '{}' failed", name))?;
            return Ok(UnloadMethod::Forced);
        }

        Err(last_error.context(format!(
            "module '{}' still in use after {} retries",
            name, self.retry.max_retries
        )))
    }

    /// Load one module with modprobe.
    pub fn load(&self, core: &CoreContext, name: &str) -> Result<()> {
        let load = CommandSpec::new("modprobe")
            .arg(name)
            .elevated()
            .timeout(MODULE_COMMAND_TIMEOUT);
        core.run_checked(&load)
            .with_context(|| format!("loading module '{}'", name))?;
        Ok(())
    }

    /// Reload modules that were unloaded in `unloaded` order.
    ///
    /// Runs in exact reverse order (base first), keeps going past failures,
    /// and returns only the first error.
    pub fn reload_all(&self, core: &CoreContext, unloaded: &[String]) -> Result<()> {
        let mut first_error = None;
        for name in unloaded.iter().rev() {
            match self.load(core, name) {
                Ok(()) => info!(module = %name, "module reloaded"),
                Err(e) => {
                    warn!(module = %name, error = %e, "module reload failed, continuing");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for KernelModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelModuleManager")
            .field("proc_modules", &self.proc_modules)
            .field("sys_module", &self.sys_module)
            .field("detector", &self.detector.is_some())
            .field("retry", &self.retry)
            .field("allow_force", &self.allow_force)
            .finish()
    }
}

/// Order `names` so every module comes after all of its dependents.
///
/// Ties keep the caller's order. Dependents outside `names` are ignored. A
/// cycle (which the kernel does not allow, but a corrupt table might show)
/// falls back to the caller's order for the remainder.
pub fn unload_order(table: &[ModuleInfo], names: &[String]) -> Vec<String> {
    let mut remaining: Vec<&String> = names.iter().collect();
    let mut order = Vec::with_capacity(names.len());

    while !remaining.is_empty() {
        let pending: HashSet<&str> = remaining.iter().map(|n| n.as_str()).collect();
        let ready = remaining.iter().position(|name| {
            table
                .iter()
                .find(|m| &m.name == *name)
                .map(|m| m.dependents.iter().all(|d| d == *name || !pending.contains(d.as_str())))
                .unwrap_or(true)
        });
        match ready {
            Some(idx) => order.push(remaining.remove(idx).clone()),
            None => {
                warn!("dependency cycle in module table, using configured order");
                order.extend(remaining.drain(..).cloned());
            }
        }
    }

    order
}

/// Convenience for error messages when a module list fails validation.
pub fn validate_module_names(names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(anyhow!("no kernel modules configured"));
    }
    for name in names {
        if !is_valid_module_name(name) {
            return Err(anyhow!(
                "invalid module name '{}': only [A-Za-z0-9_-] allowed",
                name
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancellationToken, CoreContext};
    use crate::process::CommandOutput;
    use crate::testing::{FakeExecutor, FakeModuleDetector, ModuleFixture};
    use std::sync::Arc;

    const TABLE: &str = "\
nvidia_uvm 1900544 0 - Live 0x0
nvidia_drm 126976 4 - Live 0x0
nvidia_modeset 1314816 2 nvidia_drm, Live 0x0
nvidia 55123456 10 nvidia_uvm,nvidia_modeset, Live 0x0
snd_hda_intel 61440 3 - Live 0x0
";

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_detector_decides_load_state_table_decides_order() {
        let fixture = ModuleFixture::new(TABLE);
        // Disagrees with the table: nvidia_drm is listed there but reported
        // gone, nvidia_peermem is absent there but reported loaded.
        let detector = FakeModuleDetector::new().with_loaded(["nvidia", "nvidia_modeset", "nvidia_peermem"]);
        let manager = fixture
            .manager()
            .with_detector(Some(Arc::new(detector) as Arc<dyn ModuleDetector>));

        assert!(!manager.is_loaded("nvidia_drm").unwrap());
        assert!(manager.is_loaded("nvidia_peermem").unwrap());
        assert!(manager.get("nvidia_drm").unwrap().is_some());

        let (order, not_loaded) = manager
            .plan_unload(&names(&["nvidia", "nvidia_modeset", "nvidia_drm", "nvidia_peermem"]))
            .unwrap();
        assert_eq!(order, vec!["nvidia_modeset", "nvidia", "nvidia_peermem"]);
        assert_eq!(not_loaded, vec!["nvidia_drm"]);
    }

    #[test]
    fn test_without_detector_table_decides_load_state() {
        let fixture = ModuleFixture::new(TABLE);
        let manager = fixture.manager();
        assert!(manager.is_loaded("nvidia_drm").unwrap());
        assert!(!manager.is_loaded("nvidia_peermem").unwrap());
    }

    #[test]
    fn test_unload_order_puts_dependents_first() {
        let table = parse_module_table(TABLE);
        let order = unload_order(
            &table,
            &names(&["nvidia", "nvidia_modeset", "nvidia_drm", "nvidia_uvm"]),
        );
        let pos = |n: &str| order.iter().position(|m| m == n).unwrap();
        assert!(pos("nvidia_drm") < pos("nvidia_modeset"));
        assert!(pos("nvidia_modeset") < pos("nvidia"));
        assert!(pos("nvidia_uvm") < pos("nvidia"));
        assert_eq!(order.last().unwrap(), "nvidia");
    }

    #[test]
    fn test_unload_order_with_cycle_falls_back() {
        let table = parse_module_table("a 1 1 b, Live 0x0\nb 1 1 a, Live 0x0\n");
        let order = unload_order(&table, &names(&["a", "b"]));
        assert_eq!(order, names(&["a", "b"]));
    }

    #[test]
    fn test_plan_unload_skips_missing_modules() {
        let fixture = ModuleFixture::new(TABLE);
        let (order, not_loaded) = fixture
            .manager()
            .plan_unload(&names(&["nvidia_peermem", "nvidia"]))
            .unwrap();
        assert_eq!(order, names(&["nvidia"]));
        assert_eq!(not_loaded, names(&["nvidia_peermem"]));
    }

    #[test]
    fn test_use_count_prefers_refcnt() {
        let fixture = ModuleFixture::new(TABLE);
        fixture.set_refcnt("nvidia", 0);
        let manager = fixture.manager();
        assert_eq!(manager.use_count("nvidia").unwrap(), 0);
        // No refcnt file: falls back to the table column.
        assert_eq!(manager.use_count("nvidia_drm").unwrap(), 4);
        assert_eq!(manager.use_count("absent").unwrap(), 0);
    }

    #[test]
    fn test_unload_all_success_removes_from_table() {
        let fixture = ModuleFixture::new(TABLE);
        let exec = Arc::new(fixture.executor());
        let core = CoreContext::new(exec.clone());
        let manager = fixture.manager();

        let outcome = manager.unload_all(
            &core,
            &names(&["nvidia_drm", "nvidia_modeset", "nvidia_uvm", "nvidia"]),
        );
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.unloaded.len(), 4);
        assert_eq!(outcome.unloaded.last().unwrap(), "nvidia");
        assert!(!manager.is_loaded("nvidia").unwrap());
        assert!(manager.is_loaded("snd_hda_intel").unwrap());
    }

    #[test]
    fn test_unused_module_failure_is_not_retried() {
        let fixture = ModuleFixture::new(TABLE);
        fixture.set_refcnt("nvidia_uvm", 0);
        let exec = Arc::new(
            FakeExecutor::new().respond("modprobe", CommandOutput::with_exit_code(1).with_stderr("boom")),
        );
        let core = CoreContext::new(exec.clone());
        let manager = fixture.manager().with_retry(quick_retry()).with_force(true);

        let err = manager.unload_one(&core, "nvidia_uvm").unwrap_err();
        assert!(format!("{:#}", err).contains("not in use"));
        assert_eq!(exec.call_count("modprobe"), 1);
        assert_eq!(exec.call_count("rmmod"), 0);
    }

    #[test]
    fn test_in_use_module_retries_then_forces() {
        let fixture = ModuleFixture::new(TABLE);
        let exec = Arc::new(
            FakeExecutor::new().respond("modprobe", CommandOutput::with_exit_code(1).with_stderr("in use")),
        );
        let core = CoreContext::new(exec.clone());
        let manager = fixture.manager().with_retry(quick_retry()).with_force(true);

        let method = manager.unload_one(&core, "nvidia").unwrap();
        assert_eq!(method, UnloadMethod::Forced);
        assert_eq!(exec.call_count("modprobe"), 3);
        assert_eq!(exec.call_count("rmmod"), 1);
    }

    #[test]
    fn test_in_use_module_without_force_fails() {
        let fixture = ModuleFixture::new(TABLE);
        let exec = Arc::new(
            FakeExecutor::new().respond("modprobe", CommandOutput::with_exit_code(1)),
        );
        let core = CoreContext::new(exec.clone());
        let manager = fixture.manager().with_retry(quick_retry());

        let err = manager.unload_one(&core, "nvidia").unwrap_err();
        assert!(format!("{:#}", err).contains("after 2 retries"));
        assert_eq!(exec.call_count("rmmod"), 0);
    }

    #[test]
    fn test_partial_unload_records_exact_subset() {
        let fixture = ModuleFixture::new(TABLE);
        // nvidia_modeset refuses to go away; nothing after it should be attempted.
        let exec = Arc::new(fixture.executor().fail_when(|spec| {
            spec.program == "modprobe" && spec.args.iter().any(|a| a == "nvidia_modeset")
        }));
        let core = CoreContext::new(exec.clone());
        let manager = fixture.manager().with_retry(quick_retry());

        let outcome = manager.unload_all(
            &core,
            &names(&["nvidia_drm", "nvidia_modeset", "nvidia_uvm", "nvidia"]),
        );
        assert!(!outcome.is_success());
        assert!(!outcome.unloaded.contains(&"nvidia_modeset".to_string()));
        assert!(!outcome.unloaded.contains(&"nvidia".to_string()));
        assert!(outcome.unloaded.contains(&"nvidia_drm".to_string()));
    }

    #[test]
    fn test_cancellation_before_retry_stops() {
        let fixture = ModuleFixture::new(TABLE);
        let token = CancellationToken::new();
        let cancel_on_fail = token.clone();
        let exec = Arc::new(FakeExecutor::new().with_handler(move |spec| {
            if spec.program == "modprobe" {
                cancel_on_fail.cancel();
                return Ok(CommandOutput::with_exit_code(1));
            }
            Ok(CommandOutput::ok())
        }));
        let core = CoreContext::new(exec.clone()).with_cancellation(token);
        let manager = fixture.manager().with_retry(quick_retry()).with_force(true);

        let err = manager.unload_one(&core, "nvidia").unwrap_err();
        assert!(crate::error::is_cancelled(&err));
        assert_eq!(exec.call_count("modprobe"), 1);
        assert_eq!(exec.call_count("rmmod"), 0);
    }

    #[test]
    fn test_reload_reverse_order_continues_past_failures() {
        let exec = Arc::new(FakeExecutor::new().fail_when(|spec| {
            spec.program == "modprobe" && spec.args == ["nvidia_modeset"]
        }));
        let core = CoreContext::new(exec.clone());
        let manager = KernelModuleManager::new();

        let unloaded = names(&["nvidia_drm", "nvidia_modeset", "nvidia"]);
        let err = manager.reload_all(&core, &unloaded).unwrap_err();
        assert!(format!("{:#}", err).contains("nvidia_modeset"));

        let loaded: Vec<String> = exec
            .calls()
            .into_iter()
            .map(|spec| spec.args.join(" "))
            .collect();
        assert_eq!(loaded, vec!["nvidia", "nvidia_modeset", "nvidia_drm"]);
    }

    #[test]
    fn test_validate_module_names() {
        assert!(validate_module_names(&names(&["nvidia", "nvidia_drm"])).is_ok());
        assert!(validate_module_names(&[]).is_err());
        assert!(validate_module_names(&names(&["nvidia", "x$(reboot)"])).is_err());
    }
}
