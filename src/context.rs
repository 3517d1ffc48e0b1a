//! Execution context shared by every step of one lifecycle operation.
//!
//! The context is split in two layers:
//!
//! - [`CoreContext`] - what every step needs regardless of domain:
//!   cancellation, dry-run/force flags, the process executor, the privilege
//!   handle, and the shared [`StateStore`].
//! - [`ExecutionContext`] - the driver-lifecycle context, which embeds a
//!   `CoreContext` (reachable through `Deref`) and adds the distribution,
//!   package manager and module introspection collaborators.
//!
//! A context is created per top-level operation and dropped afterwards.
//! Logging goes through `tracing`; with no subscriber installed it is a no-op.

use anyhow::{anyhow, Result};
use std::any::Any;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::distro::Distribution;
use crate::elevation::Elevator;
use crate::error::{Cancelled, ExecError};
use crate::kmod::ModuleDetector;
use crate::package::PackageManager;
use crate::process::{CommandExecutor, CommandOutput, CommandSpec};

/// Well-known shared-state keys.
///
/// Steps write facts under these keys; the orchestrator reads the reporting
/// keys to build the [`crate::report::ExecutionReport`].
pub mod keys {
    /// `Vec<String>`: packages removed so far.
    pub const REMOVED_PACKAGES: &str = "packages.removed";
    /// `Vec<String>`: packages whose removal failed or was never attempted.
    pub const FAILED_PACKAGES: &str = "packages.failed";
    /// `DiscoveredPackages`: last discovery snapshot.
    pub const DISCOVERED_PACKAGES: &str = "packages.discovered";
    /// `Vec<PathBuf>`: configuration files removed.
    pub const REMOVED_CONFIGS: &str = "config.removed";
    /// `Vec<BackupEntry>`: backups taken by configuration cleanup.
    pub const CONFIG_BACKUPS: &str = "config.backups";
    /// `PathBuf`: backup session directory of the last cleanup.
    pub const CONFIG_BACKUP_SESSION: &str = "config.backup_session";
    /// `Vec<String>`: modules unloaded, in unload order.
    pub const UNLOADED_MODULES: &str = "modules.unloaded";
    /// `Vec<RemovedFile>`: blacklist files removed by driver restore.
    pub const REMOVED_BLACKLISTS: &str = "restore.removed_blacklists";
    /// `bool`: boot image was regenerated by driver restore.
    pub const BOOT_IMAGE_REGENERATED: &str = "restore.boot_image_regenerated";
    /// `bool`: fallback module was loaded by driver restore.
    pub const FALLBACK_LOADED: &str = "restore.fallback_loaded";
    /// `bool`: a reboot is needed to finish the operation.
    pub const REBOOT_REQUIRED: &str = "report.reboot_required";
    /// `bool`: the fallback driver is restored.
    pub const DRIVER_RESTORED: &str = "report.driver_restored";
    /// `bool`: commands run with full privileges.
    pub const PRIVILEGED: &str = "preflight.privileged";
    /// `bool`: secure boot is enabled (absent when unknown).
    pub const SECURE_BOOT: &str = "preflight.secure_boot";
}

/// Once-settable, many-observable cancellation signal.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type Slot = Box<dyn Any + Send + Sync>;

/// Typed key/value store guarded by one reader/writer lock.
///
/// Last write wins per key. Reading a key under the wrong type yields `None`.
#[derive(Default)]
pub struct StateStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.insert(key.into(), Box::new(value));
    }

    /// Clone the value stored under `key`, if present with type `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    /// Like [`StateStore::get`] but with a fallback for absent or mistyped values.
    pub fn get_or_default<T: Any + Clone + Default>(&self, key: &str) -> T {
        self.get(key).unwrap_or_default()
    }

    /// Mutate the value under `key` in place.
    ///
    /// An absent or mistyped value is replaced by `T::default()` first.
    pub fn update<T, F>(&self, key: &str, f: F)
    where
        T: Any + Send + Sync + Default,
        F: FnOnce(&mut T),
    {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry(key.to_string())
            .or_insert_with(|| Box::new(T::default()));
        if !slot.is::<T>() {
            *slot = Box::new(T::default());
        }
        if let Some(value) = slot.downcast_mut::<T>() {
            f(value);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = slots.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Domain-independent part of the context.
pub struct CoreContext {
    cancellation: CancellationToken,
    dry_run: bool,
    force: bool,
    state: StateStore,
    executor: Arc<dyn CommandExecutor>,
    elevator: Option<Arc<dyn Elevator>>,
}

impl CoreContext {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            dry_run: false,
            force: false,
            state: StateStore::new(),
            executor,
            elevator: None,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Share an existing cancellation token (e.g. one wired to Ctrl-C).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_elevator(mut self, elevator: Arc<dyn Elevator>) -> Self {
        self.elevator = Some(elevator);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn is_force(&self) -> bool {
        self.force
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(anyhow::Error::new(Cancelled));
        }
        Ok(())
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    pub fn elevator(&self) -> Option<&Arc<dyn Elevator>> {
        self.elevator.as_ref()
    }

    /// Run a command through the executor. Non-zero exits are data.
    pub fn run(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, ExecError> {
        debug!(command = %spec.display(), "running command");
        self.executor.execute(spec)
    }

    /// Run a command and treat a non-zero exit as an error.
    pub fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec).map_err(|e| anyhow!(e))?;
        output.ensure_success(&format!("'{}' failed", spec.display()))
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("dry_run", &self.dry_run)
            .field("force", &self.force)
            .field("cancelled", &self.is_cancelled())
            .field("state", &self.state)
            .finish()
    }
}

/// Context for driver lifecycle operations.
pub struct ExecutionContext {
    core: CoreContext,
    distribution: Distribution,
    package_manager: Option<Arc<dyn PackageManager>>,
    module_detector: Option<Arc<dyn ModuleDetector>>,
}

impl ExecutionContext {
    pub fn new(core: CoreContext, distribution: Distribution) -> Self {
        Self {
            core,
            distribution,
            package_manager: None,
            module_detector: None,
        }
    }

    pub fn with_package_manager(mut self, package_manager: Arc<dyn PackageManager>) -> Self {
        self.package_manager = Some(package_manager);
        self
    }

    pub fn with_module_detector(mut self, detector: Arc<dyn ModuleDetector>) -> Self {
        self.module_detector = Some(detector);
        self
    }

    pub fn core(&self) -> &CoreContext {
        &self.core
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn package_manager(&self) -> Option<&Arc<dyn PackageManager>> {
        self.package_manager.as_ref()
    }

    pub fn module_detector(&self) -> Option<&Arc<dyn ModuleDetector>> {
        self.module_detector.as_ref()
    }
}

impl Deref for ExecutionContext {
    type Target = CoreContext;

    fn deref(&self) -> &CoreContext {
        &self.core
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("core", &self.core)
            .field("distribution", &self.distribution)
            .field("package_manager", &self.package_manager.is_some())
            .field("module_detector", &self.module_detector.is_some())
            .finish()
    }
}
