//! Unload the vendor kernel modules.

use anyhow::Result;
use tracing::{info, warn};

use crate::context::{keys, ExecutionContext};
use crate::kmod::{
    validate_module_names, KernelModuleManager, RetryPolicy, DEFAULT_VENDOR_MODULES,
};
use crate::step::{Step, StepResult};

/// Unloads a configured set of modules dependents-first.
///
/// Records the modules actually removed under [`keys::UNLOADED_MODULES`];
/// rollback reloads exactly those, base module first.
#[derive(Debug, Clone)]
pub struct ModuleUnloadStep {
    modules: Vec<String>,
    manager: KernelModuleManager,
}

impl Default for ModuleUnloadStep {
    fn default() -> Self {
        Self::new(DEFAULT_VENDOR_MODULES.iter().map(|m| m.to_string()).collect())
    }
}

impl ModuleUnloadStep {
    pub fn new(modules: Vec<String>) -> Self {
        Self {
            modules,
            manager: KernelModuleManager::new(),
        }
    }

    /// Use a preconfigured manager (alternate table paths in tests).
    pub fn with_manager(mut self, manager: KernelModuleManager) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.manager = self.manager.with_retry(retry);
        self
    }

    /// Permit `rmmod -f` when a module stays busy.
    pub fn with_force(mut self, allow_force: bool) -> Self {
        self.manager = self.manager.with_force(allow_force);
        self
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    fn manager_for(&self, ctx: &ExecutionContext) -> KernelModuleManager {
        match ctx.module_detector() {
            Some(detector) => self.manager.clone().with_detector(Some(detector.clone())),
            None => self.manager.clone(),
        }
    }
}

impl Step for ModuleUnloadStep {
    fn name(&self) -> &str {
        "module-unload"
    }

    fn description(&self) -> &str {
        "Unload vendor kernel modules"
    }

    fn validate(&self, _ctx: &ExecutionContext) -> Result<()> {
        validate_module_names(&self.modules)
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepResult {
        if let Err(e) = ctx.check_cancelled() {
            return StepResult::failed(e);
        }

        let manager = self.manager_for(ctx);
        let (order, not_loaded) = match manager.plan_unload(&self.modules) {
            Ok(plan) => plan,
            Err(e) => return StepResult::failed(e),
        };
        if order.is_empty() {
            return StepResult::skipped("nothing loaded");
        }
        if !not_loaded.is_empty() {
            info!(modules = ?not_loaded, "modules not loaded, skipping");
        }

        if ctx.is_dry_run() {
            info!(modules = ?order, "dry run: would unload modules");
            return StepResult::completed(format!("dry run: would unload {}", order.join(", ")));
        }

        let outcome = manager.unload_all(ctx, &self.modules);
        if !outcome.unloaded.is_empty() {
            ctx.state()
                .update::<Vec<String>, _>(keys::UNLOADED_MODULES, |list| {
                    for name in &outcome.unloaded {
                        if !list.contains(name) {
                            list.push(name.clone());
                        }
                    }
                });
        }
        if !outcome.forced.is_empty() {
            warn!(modules = ?outcome.forced, "modules were force-removed");
        }

        let can_rollback = !outcome.unloaded.is_empty();
        match outcome.error {
            Some(e) => {
                let message = format!(
                    "unloaded {} of {} module(s): {:#}",
                    outcome.unloaded.len(),
                    order.len(),
                    e
                );
                StepResult::failed_with(message, e).with_rollback(can_rollback)
            }
            None => StepResult::completed(format!(
                "unloaded {} module(s): {}",
                outcome.unloaded.len(),
                outcome.unloaded.join(", ")
            ))
            .with_rollback(can_rollback),
        }
    }

    fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let unloaded: Vec<String> = ctx.state().get_or_default(keys::UNLOADED_MODULES);
        if unloaded.is_empty() {
            return Ok(());
        }
        info!(modules = ?unloaded, "reloading unloaded modules");
        self.manager_for(ctx).reload_all(ctx, &unloaded)?;
        ctx.state().remove(keys::UNLOADED_MODULES);
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }
}
