//! Concrete steps of the driver lifecycle.
//!
//! | Step | Reversible |
//! |------|------------|
//! | [`PreflightStep`] | no (read-only) |
//! | [`ModuleUnloadStep`] | yes, reloads exactly what was unloaded |
//! | [`PackageRemovalStep`] | no |
//! | [`ConfigCleanupStep`] | when backups are enabled |
//! | [`DriverRestoreStep`] | yes |

pub mod config_cleanup;
pub mod driver_restore;
pub mod module_unload;
pub mod package_removal;
pub mod preflight;

pub use config_cleanup::{is_valid_config_path, validate_config_path, ConfigCleanupStep};
pub use driver_restore::{DriverRestoreStep, RemovedFile};
pub use module_unload::ModuleUnloadStep;
pub use package_removal::PackageRemovalStep;
pub use preflight::PreflightStep;
