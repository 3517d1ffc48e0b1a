//! Parser for the live kernel module table (`/proc/modules`).
//!
//! Each record looks like:
//!
//! ```text
//! nvidia_drm 126976 4 - Live 0xffffffffc1a2b000 (POE)
//! nvidia 55123456 10 nvidia_modeset,nvidia_drm, Live 0x0
//! ```
//!
//! i.e. `name size use_count deps state address [taint]`, where `deps` is a
//! comma-separated list of modules that use this one (trailing comma allowed)
//! or `-` for none. Malformed records are skipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state column of a module record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    Live,
    Loading,
    Unloading,
}

impl FromStr for ModuleState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Live" => Ok(ModuleState::Live),
            "Loading" => Ok(ModuleState::Loading),
            "Unloading" => Ok(ModuleState::Unloading),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Live => write!(f, "Live"),
            ModuleState::Loading => write!(f, "Loading"),
            ModuleState::Unloading => write!(f, "Unloading"),
        }
    }
}

/// One loaded kernel module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub size: u64,
    pub use_count: u32,
    /// Modules that depend on (use) this one.
    pub dependents: Vec<String>,
    pub state: ModuleState,
}

impl ModuleInfo {
    pub fn is_used_by(&self, other: &str) -> bool {
        self.dependents.iter().any(|d| d == other)
    }
}

/// Parse a single record. Returns `None` for anything malformed.
pub fn parse_module_line(line: &str) -> Option<ModuleInfo> {
    let mut fields = line.split_whitespace();
    let name = fields.next()?;
    let size = fields.next()?.parse().ok()?;
    let use_count = fields.next()?.parse().ok()?;
    let deps = fields.next()?;
    let state = fields.next()?.parse().ok()?;

    if !is_valid_module_name(name) {
        return None;
    }

    let dependents = if deps == "-" {
        Vec::new()
    } else {
        deps.split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    };

    Some(ModuleInfo {
        name: name.to_string(),
        size,
        use_count,
        dependents,
        state,
    })
}

/// Parse a whole table, skipping malformed records.
pub fn parse_module_table(content: &str) -> Vec<ModuleInfo> {
    content.lines().filter_map(parse_module_line).collect()
}

/// Module names are restricted to `[A-Za-z0-9_-]`.
///
/// Names end up as command arguments, so anything else is rejected.
pub fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
