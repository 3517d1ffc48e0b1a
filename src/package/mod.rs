//! Package management: the collaborator interface, vendor package discovery,
//! and a command-backed implementation for the supported families.

pub mod backend;
pub mod discovery;

pub use backend::CommandPackageManager;
pub use discovery::{DiscoveredPackages, PackageCategory, PackageDiscovery};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One installed package as reported by the package manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Option<String>,
    pub arch: Option<String>,
}

impl InstalledPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            arch: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Options for a removal transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOptions {
    /// Also remove configuration files owned by the packages.
    pub purge: bool,
    /// Remove dependencies orphaned by the removal.
    pub auto_remove: bool,
    /// Do not prompt for confirmation.
    pub assume_yes: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            purge: true,
            auto_remove: false,
            assume_yes: true,
        }
    }
}

/// Package management collaborator.
pub trait PackageManager: Send + Sync {
    /// Short backend name for logs (`apt`, `dnf`, ...).
    fn name(&self) -> &str;

    fn list_installed(&self) -> Result<Vec<InstalledPackage>>;

    /// Remove `packages` in one transaction.
    fn remove(&self, packages: &[String], options: &RemoveOptions) -> Result<()>;
}

/// Package names are restricted to characters every supported manager allows.
pub fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-' | ':' | '~'))
}
