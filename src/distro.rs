//! Host distribution detection.
//!
//! The distribution family decides which package names the vendor uses, which
//! tool rebuilds the boot image, and what the kernel header package is called.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Distribution families with distinct packaging and boot-image tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistroFamily {
    /// Debian, Ubuntu, Mint, Pop!_OS (apt, update-initramfs).
    Debian,
    /// Fedora, RHEL, CentOS, Rocky, Alma (dnf, dracut).
    RedHat,
    /// Arch, Manjaro, EndeavourOS (pacman, mkinitcpio).
    Arch,
    /// openSUSE, SLES (zypper, dracut).
    Suse,
    #[default]
    Unknown,
}

impl DistroFamily {
    /// Map an os-release `ID` or `ID_LIKE` token to a family.
    pub fn from_id(id: &str) -> Self {
        match id.trim().to_ascii_lowercase().as_str() {
            "debian" | "ubuntu" | "linuxmint" | "pop" | "elementary" | "zorin" | "kali"
            | "raspbian" => DistroFamily::Debian,
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" | "ol" | "amzn" | "nobara" => {
                DistroFamily::RedHat
            }
            "arch" | "manjaro" | "endeavouros" | "garuda" | "artix" | "cachyos" => {
                DistroFamily::Arch
            }
            "suse" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" | "sled" => {
                DistroFamily::Suse
            }
            _ => DistroFamily::Unknown,
        }
    }

    /// Command that regenerates the initramfs for all installed kernels.
    pub fn boot_image_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            DistroFamily::Debian => Some(("update-initramfs", &["-u", "-k", "all"])),
            DistroFamily::RedHat => Some(("dracut", &["--force", "--regenerate-all"])),
            DistroFamily::Suse => Some(("dracut", &["-f", "--regenerate-all"])),
            DistroFamily::Arch => Some(("mkinitcpio", &["-P"])),
            DistroFamily::Unknown => None,
        }
    }

    /// Name of the kernel header package for `kernel_release`.
    pub fn kernel_headers_package(&self, kernel_release: &str) -> String {
        match self {
            DistroFamily::Debian => format!("linux-headers-{}", kernel_release),
            DistroFamily::RedHat => format!("kernel-devel-{}", kernel_release),
            DistroFamily::Suse => "kernel-default-devel".to_string(),
            DistroFamily::Arch => {
                if kernel_release.ends_with("-lts") {
                    "linux-lts-headers".to_string()
                } else {
                    "linux-headers".to_string()
                }
            }
            DistroFamily::Unknown => "linux-headers".to_string(),
        }
    }
}

impl fmt::Display for DistroFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistroFamily::Debian => write!(f, "debian"),
            DistroFamily::RedHat => write!(f, "redhat"),
            DistroFamily::Arch => write!(f, "arch"),
            DistroFamily::Suse => write!(f, "suse"),
            DistroFamily::Unknown => write!(f, "unknown"),
        }
    }
}

/// Identity of the running distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Distribution {
    pub id: String,
    pub name: String,
    pub version_id: Option<String>,
    pub family: DistroFamily,
}

impl Distribution {
    /// A distribution known only by family. Handy for tests and overrides.
    pub fn from_family(family: DistroFamily) -> Self {
        Self {
            id: family.to_string(),
            name: family.to_string(),
            version_id: None,
            family,
        }
    }

    /// Read and parse `/etc/os-release`.
    pub fn detect() -> Result<Self> {
        Self::from_os_release_file(Path::new(OS_RELEASE_PATH))
    }

    pub fn from_os_release_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading os-release '{}'", path.display()))?;
        Ok(Self::from_os_release(&content))
    }

    /// Parse os-release content. Unknown or missing keys fall back to defaults.
    ///
    /// `ID` is tried first, then each `ID_LIKE` token in order.
    pub fn from_os_release(content: &str) -> Self {
        let mut id = String::new();
        let mut id_like = String::new();
        let mut name = String::new();
        let mut version_id = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = unquote(value);
            match key.trim() {
                "ID" => id = value,
                "ID_LIKE" => id_like = value,
                "NAME" => name = value,
                "VERSION_ID" => version_id = Some(value),
                _ => {}
            }
        }

        let family = std::iter::once(id.as_str())
            .chain(id_like.split_whitespace())
            .map(DistroFamily::from_id)
            .find(|family| *family != DistroFamily::Unknown)
            .unwrap_or(DistroFamily::Unknown);

        if name.is_empty() {
            name = id.clone();
        }

        Self {
            id,
            name,
            version_id,
            family,
        }
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
        .to_string()
}
