//! Privilege elevation.
//!
//! Removing packages, unloading modules and regenerating the boot image all
//! need root. When the process is not already privileged, elevated commands
//! are prefixed with the first available helper (`sudo`, `doas`, `pkexec`)
//! and run with a minimal fixed environment.

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Helpers tried in order when not running as root.
pub const ELEVATION_TOOLS: &[&str] = &["sudo", "doas", "pkexec"];

/// `PATH` handed to elevated commands.
pub const SANITIZED_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Privilege elevation collaborator.
pub trait Elevator: Send + Sync {
    /// True if commands already run with full privileges.
    fn is_privileged(&self) -> bool;

    /// Rewrite `program args...` into its elevated form.
    ///
    /// Returns the input unchanged when already privileged.
    fn elevate(&self, program: &str, args: &[String]) -> (String, Vec<String>);

    /// Minimal environment for elevated commands.
    fn sanitized_env(&self) -> Vec<(String, String)> {
        vec![
            ("PATH".to_string(), SANITIZED_PATH.to_string()),
            ("LANG".to_string(), "C".to_string()),
            ("LC_ALL".to_string(), "C".to_string()),
        ]
    }
}

/// Elevator using `sudo`/`doas`/`pkexec`.
#[derive(Debug, Clone)]
pub struct SudoElevator {
    tool: Option<PathBuf>,
    privileged: bool,
}

impl SudoElevator {
    /// Detect the current privilege level and the available helper.
    ///
    /// Fails only when unprivileged and no helper is installed.
    pub fn detect() -> Result<Self> {
        if effective_uid_is_root() {
            return Ok(Self {
                tool: None,
                privileged: true,
            });
        }

        for tool in ELEVATION_TOOLS {
            if let Ok(path) = which::which(tool) {
                return Ok(Self {
                    tool: Some(path),
                    privileged: false,
                });
            }
        }

        bail!(
            "Not running as root and no elevation helper found.\n\
             Install one of: {}",
            ELEVATION_TOOLS.join(", ")
        )
    }

    /// Elevator that always prefixes with `tool`.
    pub fn with_tool(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: Some(tool.into()),
            privileged: false,
        }
    }

    /// Elevator for a process that is already root.
    pub fn privileged() -> Self {
        Self {
            tool: None,
            privileged: true,
        }
    }

    fn is_sudo(&self) -> bool {
        self.tool
            .as_ref()
            .and_then(|t| t.file_name())
            .is_some_and(|name| name == "sudo")
    }
}

impl Elevator for SudoElevator {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn elevate(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        let Some(tool) = self.tool.as_ref().filter(|_| !self.privileged) else {
            return (program.to_string(), args.to_vec());
        };

        let mut elevated_args = Vec::with_capacity(args.len() + 3);
        if self.is_sudo() {
            // Never prompt; a missing credential should fail, not hang.
            elevated_args.push("-n".to_string());
            elevated_args.push("--".to_string());
        }
        elevated_args.push(program.to_string());
        elevated_args.extend(args.iter().cloned());
        (tool.to_string_lossy().into_owned(), elevated_args)
    }
}

/// True if the effective UID is 0.
pub fn effective_uid_is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
