//! Remove vendor packages through the package manager collaborator.

use anyhow::{anyhow, bail, Result};
use tracing::{info, warn};

use crate::context::{keys, ExecutionContext};
use crate::error::Cancelled;
use crate::package::{is_valid_package_name, PackageDiscovery, RemoveOptions};
use crate::step::{Step, StepResult};

/// Removes an explicit package list, every discovered vendor package, or both.
///
/// With `batch_size > 0` packages are removed in batches of that size and a
/// failing batch does not stop the others. Zero or a negative size removes
/// everything in one transaction. Removed and failed packages accumulate separately under
/// [`keys::REMOVED_PACKAGES`] and [`keys::FAILED_PACKAGES`].
#[derive(Debug, Clone)]
pub struct PackageRemovalStep {
    packages: Vec<String>,
    discover: bool,
    batch_size: i64,
    options: RemoveOptions,
}

impl Default for PackageRemovalStep {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            discover: true,
            batch_size: 0,
            options: RemoveOptions::default(),
        }
    }
}

impl PackageRemovalStep {
    /// Remove exactly `packages`, without discovery.
    pub fn new(packages: Vec<String>) -> Self {
        Self {
            packages,
            discover: false,
            ..Self::default()
        }
    }

    /// Remove every discovered vendor package.
    pub fn discovered() -> Self {
        Self::default()
    }

    pub fn with_discovery(mut self, discover: bool) -> Self {
        self.discover = discover;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_options(mut self, options: RemoveOptions) -> Self {
        self.options = options;
        self
    }

    /// Explicit packages first, then discovered ones, deduplicated.
    fn resolve_targets(&self, ctx: &ExecutionContext) -> Result<Vec<String>> {
        let mut targets: Vec<String> = Vec::new();
        for name in &self.packages {
            if !targets.contains(name) {
                targets.push(name.clone());
            }
        }

        if self.discover {
            let manager = ctx
                .package_manager()
                .ok_or_else(|| anyhow!("no package manager available"))?;
            let discovery = PackageDiscovery::new(ctx.distribution().family)?;
            let found = discovery.discover_from(manager.as_ref())?;
            info!(
                total = found.total_count,
                driver_version = ?found.driver_version,
                toolkit_version = ?found.toolkit_version,
                "vendor packages discovered"
            );
            for name in found.all() {
                if !targets.contains(&name) {
                    targets.push(name);
                }
            }
            ctx.state().set(keys::DISCOVERED_PACKAGES, found);
        }

        Ok(targets)
    }

    fn batches<'a>(&self, targets: &'a [String]) -> Vec<&'a [String]> {
        match usize::try_from(self.batch_size) {
            Ok(size) if size > 0 => targets.chunks(size).collect(),
            _ => vec![targets],
        }
    }
}

fn append_unique(ctx: &ExecutionContext, key: &str, names: &[String]) {
    if names.is_empty() {
        return;
    }
    ctx.state().update::<Vec<String>, _>(key, |list| {
        for name in names {
            if !list.contains(name) {
                list.push(name.clone());
            }
        }
    });
}

impl Step for PackageRemovalStep {
    fn name(&self) -> &str {
        "package-removal"
    }

    fn description(&self) -> &str {
        "Remove vendor driver packages"
    }

    fn validate(&self, ctx: &ExecutionContext) -> Result<()> {
        if ctx.package_manager().is_none() {
            bail!("no package manager available");
        }
        if self.packages.is_empty() && !self.discover {
            bail!("no packages configured and discovery disabled");
        }
        if let Some(bad) = self.packages.iter().find(|p| !is_valid_package_name(p)) {
            bail!("invalid package name '{}'", bad);
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepResult {
        if let Err(e) = ctx.check_cancelled() {
            return StepResult::failed(e);
        }
        let Some(manager) = ctx.package_manager() else {
            return StepResult::failed(anyhow!("no package manager available"));
        };

        let targets = match self.resolve_targets(ctx) {
            Ok(targets) => targets,
            Err(e) => return StepResult::failed(e.context("resolving packages to remove")),
        };
        let (targets, invalid): (Vec<String>, Vec<String>) =
            targets.into_iter().partition(|p| is_valid_package_name(p));
        if !invalid.is_empty() {
            warn!(packages = ?invalid, "skipping packages with unsafe names");
        }
        if targets.is_empty() && invalid.is_empty() {
            return StepResult::skipped("no packages to remove");
        }

        if ctx.is_dry_run() {
            info!(packages = ?targets, "dry run: would remove packages");
            return StepResult::completed(format!(
                "dry run: would remove {} package(s): {}",
                targets.len(),
                targets.join(", ")
            ));
        }

        let mut removed: Vec<String> = Vec::new();
        let mut failed: Vec<String> = invalid;
        let mut first_error = None;
        let mut cancelled = false;

        let batches = self.batches(&targets);
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            if cancelled || ctx.is_cancelled() {
                cancelled = true;
                failed.extend(batch.iter().cloned());
                continue;
            }
            info!(batch = index + 1, of = batch_count, packages = ?batch, "removing packages");
            match manager.remove(batch, &self.options) {
                Ok(()) => removed.extend(batch.iter().cloned()),
                Err(e) => {
                    warn!(packages = ?batch, error = %format!("{:#}", e), "batch removal failed");
                    failed.extend(batch.iter().cloned());
                    first_error.get_or_insert(e);
                }
            }
        }

        append_unique(ctx, keys::REMOVED_PACKAGES, &removed);
        append_unique(ctx, keys::FAILED_PACKAGES, &failed);

        let total = removed.len() + failed.len();
        if cancelled {
            let message = format!(
                "cancelled after removing {} of {} package(s)",
                removed.len(),
                total
            );
            return StepResult::failed_with(message, anyhow::Error::new(Cancelled));
        }
        if removed.is_empty() && !failed.is_empty() {
            let error = first_error.unwrap_or_else(|| anyhow!("no removable packages"));
            let message = format!("failed to remove all {} package(s): {:#}", total, error);
            return StepResult::failed_with(message, error);
        }
        if !failed.is_empty() {
            return StepResult::completed(format!(
                "partially removed {} of {} package(s); failed: {}",
                removed.len(),
                total,
                failed.join(", ")
            ));
        }
        StepResult::completed(format!("removed {} package(s)", removed.len()))
    }

    fn rollback(&self, ctx: &ExecutionContext) -> Result<()> {
        let removed: Vec<String> = ctx.state().get_or_default(keys::REMOVED_PACKAGES);
        if !removed.is_empty() {
            warn!(packages = ?removed, "package removal cannot be rolled back; reinstall manually");
        }
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        false
    }
}
