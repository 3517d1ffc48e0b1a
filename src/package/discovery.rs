//! Vendor package discovery and categorization.
//!
//! Discovery runs in two passes over the installed-package list:
//!
//! 1. Keep only vendor-related names (fixed, case-insensitive patterns).
//! 2. Put each survivor into exactly one [`PackageCategory`] using the
//!    family's ordered rule table: kernel-module, compute-toolkit, library,
//!    utility, configuration, and finally the generic driver bucket. The
//!    first matching rule wins, so specific categories beat the catch-all.
//!
//! Version strings are derived from package names with ordered pattern
//! lists. The first pattern that matches any package wins; this is a
//! heuristic and does not guarantee the newest version is picked.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::{InstalledPackage, PackageManager};
use crate::distro::DistroFamily;

/// Semantic category of a vendor package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageCategory {
    KernelModule,
    ComputeToolkit,
    Library,
    Utility,
    Config,
    Driver,
}

impl PackageCategory {
    /// Order in which rules are tried. `Driver` is the catch-all.
    pub const CLASSIFICATION_ORDER: [PackageCategory; 5] = [
        PackageCategory::KernelModule,
        PackageCategory::ComputeToolkit,
        PackageCategory::Library,
        PackageCategory::Utility,
        PackageCategory::Config,
    ];
}

impl fmt::Display for PackageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageCategory::KernelModule => write!(f, "kernel-module"),
            PackageCategory::ComputeToolkit => write!(f, "compute-toolkit"),
            PackageCategory::Library => write!(f, "library"),
            PackageCategory::Utility => write!(f, "utility"),
            PackageCategory::Config => write!(f, "config"),
            PackageCategory::Driver => write!(f, "driver"),
        }
    }
}

/// Names that identify a package as part of the vendor stack.
const VENDOR_PATTERNS: &[&str] = &[
    r"nvidia",
    r"^cuda",
    r"^libcu(da|blas|fft|rand|solver|sparse|dnn)",
    r"cudnn",
    r"^(lib)?nccl",
    r"^libnv(cuvid|optix|rtc|jpeg|infer|toolsext)",
    r"^libxnvctrl",
    r"^nsight",
];

type RuleTable = &'static [(PackageCategory, &'static [&'static str])];

const DEBIAN_RULES: RuleTable = &[
    (
        PackageCategory::KernelModule,
        &[
            r"^nvidia-dkms",
            r"^nvidia-kernel-",
            r"^nvidia-fs-dkms",
            r"^linux-(modules|objects|signatures)-nvidia",
        ],
    ),
    (
        PackageCategory::ComputeToolkit,
        &[
            r"^cuda",
            r"^nvidia-cuda",
            r"^nvidia-opencl",
            r"^libnvidia-compute",
            r"^libcu(da|blas|fft|rand|solver|sparse|dnn)",
            r"cudnn",
            r"nccl",
            r"^libnv(rtc|jpeg|infer)",
            r"^nsight",
        ],
    ),
    (
        PackageCategory::Library,
        &[
            r"^libnvidia-(encode|decode|fbc|cfg|extra|common|egl|gpucomp|ifr|ml)",
            r"^libnv(cuvid|optix|toolsext)",
            r"^libxnvctrl",
        ],
    ),
    (
        PackageCategory::Utility,
        &[r"^nvidia-(settings|smi|utils|prime|persistenced|modprobe|xconfig|compute-utils|detect)"],
    ),
    (
        PackageCategory::Config,
        &[r"^nvidia-(common|alternative|installer-cleanup)", r"^nvidia-.*-config$"],
    ),
];

const REDHAT_RULES: RuleTable = &[
    (
        PackageCategory::KernelModule,
        &[r"^(kmod|akmod|dkms)-nvidia", r"^nvidia-(open-)?kmod"],
    ),
    (
        PackageCategory::ComputeToolkit,
        &[
            r"^cuda",
            r"^xorg-x11-drv-nvidia-cuda",
            r"^nvidia-driver-cuda",
            r"^libcu(da|blas|fft|rand|solver|sparse|dnn)",
            r"cudnn",
            r"nccl",
            r"^nsight",
        ],
    ),
    (
        PackageCategory::Library,
        &[
            r"^nvidia-driver-libs",
            r"^xorg-x11-drv-nvidia-libs",
            r"^libnvidia",
            r"^libxnvctrl",
            r"^nvidia-libxnvctrl",
        ],
    ),
    (
        PackageCategory::Utility,
        &[r"^nvidia-(settings|persistenced|modprobe|xconfig|smi)"],
    ),
    (PackageCategory::Config, &[r"^nvidia-.*-(common|config)$"]),
];

const ARCH_RULES: RuleTable = &[
    (
        PackageCategory::KernelModule,
        &[r"^nvidia(-open|-lts|-beta)?(-dkms)?$", r"^nvidia-\d+xx-dkms$"],
    ),
    (
        PackageCategory::ComputeToolkit,
        &[r"^cuda", r"^(lib32-)?opencl-nvidia", r"cudnn", r"nccl", r"^nsight"],
    ),
    (
        PackageCategory::Library,
        &[r"^lib32-nvidia", r"^(lib32-)?libxnvctrl"],
    ),
    (PackageCategory::Utility, &[r"^nvidia-(settings|prime|smi)"]),
    (PackageCategory::Config, &[r"^nvidia-.*-(common|config)$"]),
];

const SUSE_RULES: RuleTable = &[
    (
        PackageCategory::KernelModule,
        &[r"-kmp-", r"^nvidia-open-driver", r"^kernel-firmware-nvidia"],
    ),
    (
        PackageCategory::ComputeToolkit,
        &[r"^cuda", r"^nvidia-compute-?g\d+", r"cudnn", r"nccl"],
    ),
    (
        PackageCategory::Library,
        &[r"^nvidia-gl-?g\d+", r"^libnvidia", r"^libxnvctrl"],
    ),
    (PackageCategory::Utility, &[r"^nvidia-(settings|utils|compute-utils)"]),
    (PackageCategory::Config, &[r"^nvidia-.*-(common|config)$"]),
];

/// Family-agnostic rules for unrecognized distributions.
const DEFAULT_RULES: RuleTable = &[
    (PackageCategory::KernelModule, &[r"dkms", r"kmod", r"-kmp-", r"kernel"]),
    (
        PackageCategory::ComputeToolkit,
        &[r"^cuda", r"cudnn", r"nccl", r"opencl"],
    ),
    (PackageCategory::Library, &[r"^lib"]),
    (
        PackageCategory::Utility,
        &[r"settings", r"smi", r"persistenced", r"modprobe", r"xconfig", r"utils"],
    ),
    (PackageCategory::Config, &[r"config", r"common"]),
];

/// Driver branch from names, in priority order. Group 1 is the version.
const DRIVER_VERSION_PATTERNS: &[&str] = &[
    r"^nvidia-driver-(\d+)",
    r"^nvidia-(?:utils|dkms|kernel-source|kernel-common|compute-utils)-(\d+)",
    r"^xserver-xorg-video-nvidia-(\d+)",
    r"^libnvidia-[a-z0-9]+-(\d+)$",
    r"^nvidia-(\d+)xx",
    r"^nvidia-[a-z-]*g(\d+)",
];

/// Compute toolkit version from names. `-` separators become `.`.
const TOOLKIT_VERSION_PATTERNS: &[&str] = &[
    r"^cuda-toolkit-(\d+[-.]\d+)",
    r"^cuda-(\d+[-.]\d+)",
    r"^cuda-runtime-(\d+[-.]\d+)",
    r"^cuda-libraries-(\d+[-.]\d+)",
];

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).with_context(|| format!("compiling pattern '{}'", p)))
        .collect()
}

/// Result of one discovery pass. Immutable snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPackages {
    pub driver: Vec<String>,
    pub compute_toolkit: Vec<String>,
    pub library: Vec<String>,
    pub utility: Vec<String>,
    pub kernel_module: Vec<String>,
    pub config: Vec<String>,
    pub driver_version: Option<String>,
    pub toolkit_version: Option<String>,
    pub total_count: usize,
}

impl DiscoveredPackages {
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    pub fn category(&self, category: PackageCategory) -> &[String] {
        match category {
            PackageCategory::Driver => &self.driver,
            PackageCategory::ComputeToolkit => &self.compute_toolkit,
            PackageCategory::Library => &self.library,
            PackageCategory::Utility => &self.utility,
            PackageCategory::KernelModule => &self.kernel_module,
            PackageCategory::Config => &self.config,
        }
    }

    /// Every discovered package, grouped by category.
    pub fn all(&self) -> Vec<String> {
        [
            &self.driver,
            &self.compute_toolkit,
            &self.library,
            &self.utility,
            &self.kernel_module,
            &self.config,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    fn push(&mut self, category: PackageCategory, name: String) {
        let bucket = match category {
            PackageCategory::Driver => &mut self.driver,
            PackageCategory::ComputeToolkit => &mut self.compute_toolkit,
            PackageCategory::Library => &mut self.library,
            PackageCategory::Utility => &mut self.utility,
            PackageCategory::KernelModule => &mut self.kernel_module,
            PackageCategory::Config => &mut self.config,
        };
        if !bucket.contains(&name) {
            bucket.push(name);
            self.total_count += 1;
        }
    }
}

/// Compiled discovery rules for one distribution family.
#[derive(Debug, Clone)]
pub struct PackageDiscovery {
    family: DistroFamily,
    vendor: Vec<Regex>,
    rules: Vec<(PackageCategory, Vec<Regex>)>,
    driver_version: Vec<Regex>,
    toolkit_version: Vec<Regex>,
}

impl PackageDiscovery {
    pub fn new(family: DistroFamily) -> Result<Self> {
        let table = match family {
            DistroFamily::Debian => DEBIAN_RULES,
            DistroFamily::RedHat => REDHAT_RULES,
            DistroFamily::Arch => ARCH_RULES,
            DistroFamily::Suse => SUSE_RULES,
            DistroFamily::Unknown => DEFAULT_RULES,
        };

        let mut rules = Vec::with_capacity(table.len());
        for category in PackageCategory::CLASSIFICATION_ORDER {
            for (rule_category, patterns) in table {
                if *rule_category == category {
                    rules.push((category, compile(patterns)?));
                }
            }
        }

        Ok(Self {
            family,
            vendor: compile(VENDOR_PATTERNS)?,
            rules,
            driver_version: compile(DRIVER_VERSION_PATTERNS)?,
            toolkit_version: compile(TOOLKIT_VERSION_PATTERNS)?,
        })
    }

    pub fn family(&self) -> DistroFamily {
        self.family
    }

    pub fn is_vendor_package(&self, name: &str) -> bool {
        self.vendor.iter().any(|re| re.is_match(name))
    }

    /// Category of a vendor package. Falls through to [`PackageCategory::Driver`].
    pub fn classify(&self, name: &str) -> PackageCategory {
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(name)))
            .map(|(category, _)| *category)
            .unwrap_or(PackageCategory::Driver)
    }

    /// Categorize the vendor packages among `installed`.
    pub fn discover(&self, installed: &[InstalledPackage]) -> DiscoveredPackages {
        let mut found = DiscoveredPackages::default();
        let mut vendor_packages = Vec::new();

        for package in installed {
            if !self.is_vendor_package(&package.name) {
                continue;
            }
            let category = self.classify(&package.name);
            debug!(package = %package.name, %category, "vendor package");
            found.push(category, package.name.clone());
            vendor_packages.push(package);
        }

        let names: Vec<&str> = vendor_packages.iter().map(|p| p.name.as_str()).collect();
        found.driver_version = first_capture(&self.driver_version, &names).or_else(|| {
            vendor_packages
                .iter()
                .find(|p| found.driver.contains(&p.name) || found.kernel_module.contains(&p.name))
                .and_then(|p| p.version.as_deref())
                .and_then(upstream_version)
        });
        found.toolkit_version =
            first_capture(&self.toolkit_version, &names).map(|v| v.replace('-', "."));

        found
    }

    /// List installed packages through `manager` and categorize them.
    pub fn discover_from(&self, manager: &dyn PackageManager) -> Result<DiscoveredPackages> {
        let installed = manager
            .list_installed()
            .with_context(|| format!("listing installed packages via {}", manager.name()))?;
        Ok(self.discover(&installed))
    }
}

/// First capture of the first pattern (in order) matching any name (in order).
fn first_capture(patterns: &[Regex], names: &[&str]) -> Option<String> {
    patterns.iter().find_map(|re| {
        names
            .iter()
            .find_map(|name| re.captures(name))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Strip epoch and packaging release: `3:550.54.14-1.fc39` -> `550.54.14`.
fn upstream_version(raw: &str) -> Option<String> {
    let without_epoch = raw.split_once(':').map(|(_, v)| v).unwrap_or(raw);
    let upstream = without_epoch.split('-').next().unwrap_or(without_epoch).trim();
    if upstream.is_empty() {
        None
    } else {
        Some(upstream.to_string())
    }
}
