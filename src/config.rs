//! TOML configuration for the uninstall workflow.
//!
//! Every field has a default, so an empty file (or no file) yields the
//! standard uninstall: preflight, module unload, package removal, config
//! cleanup, driver restore.
//!
//! ```toml
//! [general]
//! error_policy = "stop_on_error"
//! rollback_on_failure = true
//!
//! [modules]
//! names = ["nvidia_drm", "nvidia_modeset", "nvidia_uvm", "nvidia"]
//! max_retries = 3
//! retry_delay_ms = 2000
//!
//! [packages]
//! discover = true
//! batch_size = 5
//!
//! [config_cleanup]
//! paths = ["/etc/X11/xorg.conf"]
//!
//! [driver_restore]
//! fallback_module = "nouveau"
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::elevation::effective_uid_is_root;
use crate::kmod::{validate_module_names, RetryPolicy, DEFAULT_VENDOR_MODULES};
use crate::orchestrator::{ErrorPolicy, OrchestratorOptions};
use crate::package::RemoveOptions;
use crate::steps::driver_restore::DEFAULT_FALLBACK_MODULE;
use crate::steps::{
    ConfigCleanupStep, DriverRestoreStep, ModuleUnloadStep, PackageRemovalStep, PreflightStep,
};
use crate::workflow::Workflow;

/// Backup root used when running as root.
pub const SYSTEM_BACKUP_DIR: &str = "/var/backups/driver-lifecycle";

pub const UNINSTALL_WORKFLOW: &str = "uninstall";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LifecycleConfig {
    pub general: GeneralConfig,
    pub modules: ModulesConfig,
    pub packages: PackagesConfig,
    pub config_cleanup: ConfigCleanupConfig,
    pub driver_restore: DriverRestoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeneralConfig {
    pub dry_run: bool,
    pub force: bool,
    pub error_policy: ErrorPolicy,
    pub rollback_on_failure: bool,
    /// Run the preflight step first.
    pub preflight: bool,
    pub require_privileges: bool,
    pub backup_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            error_policy: ErrorPolicy::StopOnError,
            rollback_on_failure: true,
            preflight: true,
            require_privileges: true,
            backup_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModulesConfig {
    pub enabled: bool,
    pub names: Vec<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub allow_force: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            enabled: true,
            names: DEFAULT_VENDOR_MODULES.iter().map(|m| m.to_string()).collect(),
            max_retries: retry.max_retries,
            retry_delay_ms: retry.delay.as_millis() as u64,
            allow_force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PackagesConfig {
    pub enabled: bool,
    pub discover: bool,
    /// Removed in addition to anything discovered.
    pub explicit: Vec<String>,
    /// Zero or negative removes everything in one transaction.
    pub batch_size: i64,
    pub purge: bool,
    pub auto_remove: bool,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        let options = RemoveOptions::default();
        Self {
            enabled: true,
            discover: true,
            explicit: Vec::new(),
            batch_size: 0,
            purge: options.purge,
            auto_remove: options.auto_remove,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConfigCleanupConfig {
    pub enabled: bool,
    /// Removed in addition to the built-in list.
    pub paths: Vec<PathBuf>,
    pub scan: bool,
    pub backup: bool,
}

impl Default for ConfigCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: Vec::new(),
            scan: true,
            backup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DriverRestoreConfig {
    pub enabled: bool,
    pub remove_blacklist: bool,
    pub regenerate_boot_image: bool,
    pub load_fallback: bool,
    pub fallback_module: String,
}

impl Default for DriverRestoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remove_blacklist: true,
            regenerate_boot_image: true,
            load_fallback: true,
            fallback_module: DEFAULT_FALLBACK_MODULE.to_string(),
        }
    }
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<LifecycleConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    let config = parse_config(&raw)
        .with_context(|| format!("parsing config '{}'", path.display()))?;
    Ok(config)
}

pub fn parse_config(raw: &str) -> Result<LifecycleConfig> {
    let config: LifecycleConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.modules.enabled {
            validate_module_names(&self.modules.names).context("invalid [modules] names")?;
        }
        if self.packages.enabled && !self.packages.discover && self.packages.explicit.is_empty() {
            bail!("[packages] has discovery disabled and no explicit packages");
        }
        if self.driver_restore.fallback_module.trim().is_empty() {
            bail!("[driver_restore] fallback_module must not be empty");
        }
        Ok(())
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            error_policy: self.general.error_policy,
            rollback_on_failure: self.general.rollback_on_failure,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.modules.max_retries,
            delay: Duration::from_millis(self.modules.retry_delay_ms),
        }
    }

    pub fn remove_options(&self) -> RemoveOptions {
        RemoveOptions {
            purge: self.packages.purge,
            auto_remove: self.packages.auto_remove,
            assume_yes: true,
        }
    }

    /// Configured backup root, else [`default_backup_dir`].
    pub fn backup_dir(&self) -> Result<PathBuf> {
        match &self.general.backup_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_backup_dir(effective_uid_is_root()),
        }
    }

    /// The standard uninstall workflow with disabled sections left out.
    pub fn uninstall_workflow(&self) -> Result<Workflow> {
        let mut workflow = Workflow::new(UNINSTALL_WORKFLOW);

        if self.general.preflight {
            workflow.add_step(
                PreflightStep::new().with_require_privileges(self.general.require_privileges),
            )?;
        }
        if self.modules.enabled {
            workflow.add_step(
                ModuleUnloadStep::new(self.modules.names.clone())
                    .with_retry(self.retry_policy())
                    .with_force(self.modules.allow_force),
            )?;
        }
        if self.packages.enabled {
            workflow.add_step(
                PackageRemovalStep::new(self.packages.explicit.clone())
                    .with_discovery(self.packages.discover)
                    .with_batch_size(self.packages.batch_size)
                    .with_options(self.remove_options()),
            )?;
        }
        if self.config_cleanup.enabled {
            workflow.add_step(
                ConfigCleanupStep::new(self.backup_dir()?)
                    .with_paths(self.config_cleanup.paths.iter().cloned())
                    .with_scan(self.config_cleanup.scan)
                    .with_backup(self.config_cleanup.backup),
            )?;
        }
        if self.driver_restore.enabled {
            workflow.add_step(
                DriverRestoreStep::new()
                    .with_remove_blacklist(self.driver_restore.remove_blacklist)
                    .with_regenerate_boot_image(self.driver_restore.regenerate_boot_image)
                    .with_load_fallback(self.driver_restore.load_fallback)
                    .with_fallback_module(self.driver_restore.fallback_module.clone()),
            )?;
        }

        Ok(workflow)
    }
}

/// `/var/backups/driver-lifecycle` for root, else under the user's local
/// data dir.
pub fn default_backup_dir(privileged: bool) -> Result<PathBuf> {
    if privileged {
        return Ok(PathBuf::from(SYSTEM_BACKUP_DIR));
    }
    let base = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("cannot determine a local data directory for backups"))?;
    Ok(base.join("driver-lifecycle").join("backups"))
}
