//! Module introspection backed by procfs/sysfs.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use super::{parse_module_table, ModuleDetector, PROC_MODULES_PATH};

pub const EFIVARS_PATH: &str = "/sys/firmware/efi/efivars";
pub const MODULES_ROOT: &str = "/lib/modules";
pub const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// EFI variable name prefix of the SecureBoot flag.
const SECURE_BOOT_VAR_PREFIX: &str = "SecureBoot-";

/// Default [`ModuleDetector`] reading `/proc`, `/sys` and `/lib/modules`.
#[derive(Debug, Clone)]
pub struct SysfsModuleDetector {
    proc_modules: PathBuf,
    efivars: PathBuf,
    modules_root: PathBuf,
}

impl Default for SysfsModuleDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsModuleDetector {
    pub fn new() -> Self {
        Self {
            proc_modules: PathBuf::from(PROC_MODULES_PATH),
            efivars: PathBuf::from(EFIVARS_PATH),
            modules_root: PathBuf::from(MODULES_ROOT),
        }
    }

    pub fn with_roots(
        proc_modules: impl Into<PathBuf>,
        efivars: impl Into<PathBuf>,
        modules_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            proc_modules: proc_modules.into(),
            efivars: efivars.into(),
            modules_root: modules_root.into(),
        }
    }

    /// Running kernel release, e.g. `6.8.0-45-generic`.
    pub fn kernel_release() -> Result<String> {
        let release = fs::read_to_string(OSRELEASE_PATH)
            .with_context(|| format!("reading kernel release from '{}'", OSRELEASE_PATH))?;
        Ok(release.trim().to_string())
    }
}

impl ModuleDetector for SysfsModuleDetector {
    fn is_loaded(&self, name: &str) -> Result<bool> {
        Ok(self.loaded_modules()?.iter().any(|m| m == name))
    }

    fn loaded_modules(&self) -> Result<Vec<String>> {
        let content = fs::read_to_string(&self.proc_modules).with_context(|| {
            format!("reading module table '{}'", self.proc_modules.display())
        })?;
        Ok(parse_module_table(&content)
            .into_iter()
            .map(|m| m.name)
            .collect())
    }

    fn secure_boot_enabled(&self) -> Result<Option<bool>> {
        if !self.efivars.is_dir() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.efivars)
            .with_context(|| format!("reading '{}'", self.efivars.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(SECURE_BOOT_VAR_PREFIX) {
                continue;
            }
            let bytes = fs::read(entry.path())
                .with_context(|| format!("reading '{}'", entry.path().display()))?;
            // 4 bytes of attributes, then the 1-byte value.
            return Ok(bytes.last().map(|b| *b == 1));
        }
        Ok(None)
    }

    fn headers_installed(&self, kernel_release: &str) -> bool {
        self.modules_root.join(kernel_release).join("build").exists()
    }
}
