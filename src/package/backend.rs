//! Package manager backed by the family's native command-line tools.

use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{is_valid_package_name, InstalledPackage, PackageManager, RemoveOptions};
use crate::distro::DistroFamily;
use crate::process::{CommandExecutor, CommandSpec};

/// Listing is read-only and quick.
const LIST_TIMEOUT: Duration = Duration::from_secs(120);
/// Removal can trigger DKMS teardown and initramfs hooks.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(1800);

const DPKG_QUERY_FORMAT: &str = "${Package}\t${Version}\t${Architecture}\t${db:Status-Status}\n";
const RPM_QUERY_FORMAT: &str = "%{NAME}\t%{VERSION}-%{RELEASE}\t%{ARCH}\n";

/// [`PackageManager`] for one distribution family, driving dpkg/apt,
/// rpm/dnf, pacman or rpm/zypper through a [`CommandExecutor`].
#[derive(Clone)]
pub struct CommandPackageManager {
    family: DistroFamily,
    executor: Arc<dyn CommandExecutor>,
}

impl CommandPackageManager {
    pub fn new(family: DistroFamily, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        if family == DistroFamily::Unknown {
            bail!("no package manager backend for unknown distribution family");
        }
        Ok(Self { family, executor })
    }

    pub fn family(&self) -> DistroFamily {
        self.family
    }

    fn run(&self, spec: CommandSpec) -> Result<String> {
        let output = self.executor.execute(&spec).map_err(|e| anyhow!(e))?;
        let output = output.ensure_success(&format!("'{}' failed", spec.display()))?;
        Ok(output.stdout)
    }

    fn list_command(&self) -> CommandSpec {
        match self.family {
            DistroFamily::Debian => {
                CommandSpec::new("dpkg-query").args(["-W", "-f", DPKG_QUERY_FORMAT])
            }
            DistroFamily::RedHat | DistroFamily::Suse | DistroFamily::Unknown => {
                CommandSpec::new("rpm").args(["-qa", "--queryformat", RPM_QUERY_FORMAT])
            }
            DistroFamily::Arch => CommandSpec::new("pacman").arg("-Q"),
        }
        .timeout(LIST_TIMEOUT)
    }

    /// Commands for one removal transaction, in execution order.
    pub fn remove_commands(&self, packages: &[String], options: &RemoveOptions) -> Vec<CommandSpec> {
        let mut commands = Vec::new();
        match self.family {
            DistroFamily::Debian => {
                let mut cmd = CommandSpec::new("apt-get");
                if options.assume_yes {
                    cmd = cmd.arg("-y");
                }
                cmd = cmd.arg(if options.purge { "purge" } else { "remove" });
                commands.push(cmd.arg("--").args(packages));
                if options.auto_remove {
                    let mut cmd = CommandSpec::new("apt-get");
                    if options.assume_yes {
                        cmd = cmd.arg("-y");
                    }
                    cmd = cmd.arg("autoremove");
                    if options.purge {
                        cmd = cmd.arg("--purge");
                    }
                    commands.push(cmd);
                }
            }
            DistroFamily::RedHat | DistroFamily::Unknown => {
                let mut cmd = CommandSpec::new("dnf").arg("remove");
                if options.assume_yes {
                    cmd = cmd.arg("-y");
                }
                cmd = cmd.arg(format!(
                    "--setopt=clean_requirements_on_remove={}",
                    options.auto_remove
                ));
                commands.push(cmd.args(packages));
            }
            DistroFamily::Arch => {
                let mut flags = String::from("-R");
                if options.purge {
                    flags.push('n');
                }
                if options.auto_remove {
                    flags.push('s');
                }
                let mut cmd = CommandSpec::new("pacman").arg(flags);
                if options.assume_yes {
                    cmd = cmd.arg("--noconfirm");
                }
                commands.push(cmd.args(packages));
            }
            DistroFamily::Suse => {
                let mut cmd = CommandSpec::new("zypper");
                if options.assume_yes {
                    cmd = cmd.arg("--non-interactive");
                }
                cmd = cmd.arg("remove");
                if options.auto_remove {
                    cmd = cmd.arg("--clean-deps");
                }
                commands.push(cmd.args(packages));
            }
        }
        commands
            .into_iter()
            .map(|c| c.elevated().timeout(REMOVE_TIMEOUT))
            .collect()
    }
}

impl PackageManager for CommandPackageManager {
    fn name(&self) -> &str {
        match self.family {
            DistroFamily::Debian => "apt",
            DistroFamily::RedHat | DistroFamily::Unknown => "dnf",
            DistroFamily::Arch => "pacman",
            DistroFamily::Suse => "zypper",
        }
    }

    fn list_installed(&self) -> Result<Vec<InstalledPackage>> {
        let stdout = self.run(self.list_command())?;
        let packages = match self.family {
            DistroFamily::Debian => parse_dpkg_query(&stdout),
            DistroFamily::Arch => parse_pacman_query(&stdout),
            _ => parse_rpm_query(&stdout),
        };
        debug!(backend = self.name(), count = packages.len(), "listed installed packages");
        Ok(packages)
    }

    fn remove(&self, packages: &[String], options: &RemoveOptions) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        if let Some(bad) = packages.iter().find(|p| !is_valid_package_name(p)) {
            bail!("invalid package name '{}'", bad);
        }
        for command in self.remove_commands(packages, options) {
            self.run(command)?;
        }
        info!(backend = self.name(), packages = ?packages, "packages removed");
        Ok(())
    }
}

impl std::fmt::Debug for CommandPackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPackageManager")
            .field("family", &self.family)
            .finish()
    }
}

/// `name\tversion\tarch\tstatus` lines; only `installed` entries are kept.
fn parse_dpkg_query(stdout: &str) -> Vec<InstalledPackage> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            let version = fields.next().unwrap_or("");
            let arch = fields.next().unwrap_or("");
            let status = fields.next().unwrap_or("installed");
            if name.is_empty() || status.trim() != "installed" {
                return None;
            }
            Some(package(name, version, arch))
        })
        .collect()
}

fn parse_rpm_query(stdout: &str) -> Vec<InstalledPackage> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(package(
                name,
                fields.next().unwrap_or(""),
                fields.next().unwrap_or(""),
            ))
        })
        .collect()
}

/// `name version` lines from `pacman -Q`.
fn parse_pacman_query(stdout: &str) -> Vec<InstalledPackage> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            Some(package(name, fields.next().unwrap_or(""), ""))
        })
        .collect()
}

fn package(name: &str, version: &str, arch: &str) -> InstalledPackage {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };
    InstalledPackage {
        name: name.to_string(),
        version: non_empty(version),
        arch: non_empty(arch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::testing::FakeExecutor;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unknown_family_has_no_backend() {
        assert!(CommandPackageManager::new(DistroFamily::Unknown, Arc::new(FakeExecutor::new())).is_err());
    }

    #[test]
    fn test_dpkg_listing_skips_config_only_entries() {
        let exec = FakeExecutor::new().respond(
            "dpkg-query",
            CommandOutput::ok().with_stdout(
                "nvidia-driver-550\t550.120-0ubuntu1\tamd64\tinstalled\n\
                 nvidia-driver-535\t535.183-0ubuntu1\tamd64\tconfig-files\n\
                 vim\t2:9.1.0016\tamd64\tinstalled\n",
            ),
        );
        let pm = CommandPackageManager::new(DistroFamily::Debian, Arc::new(exec)).unwrap();
        let installed = pm.list_installed().unwrap();
        assert_eq!(installed.len(), 2);
        assert_eq!(installed[0].name, "nvidia-driver-550");
        assert_eq!(installed[0].version.as_deref(), Some("550.120-0ubuntu1"));
        assert_eq!(installed[0].arch.as_deref(), Some("amd64"));
    }

    #[test]
    fn test_rpm_and_pacman_listing() {
        let rpm = parse_rpm_query("akmod-nvidia\t550.54.14-1.fc39\tx86_64\n\n");
        assert_eq!(rpm.len(), 1);
        assert_eq!(rpm[0].version.as_deref(), Some("550.54.14-1.fc39"));

        let pacman = parse_pacman_query("nvidia-utils 550.78-1\nlinux 6.9.1.arch1-1\n");
        assert_eq!(pacman.len(), 2);
        assert_eq!(pacman[0].name, "nvidia-utils");
        assert_eq!(pacman[0].arch, None);
    }

    #[test]
    fn test_debian_remove_commands() {
        let exec = Arc::new(FakeExecutor::new());
        let pm = CommandPackageManager::new(DistroFamily::Debian, exec.clone()).unwrap();
        let options = RemoveOptions {
            purge: true,
            auto_remove: true,
            assume_yes: true,
        };
        pm.remove(&names(&["nvidia-driver-550", "nvidia-dkms"]), &options)
            .unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].display(),
            "apt-get -y purge -- nvidia-driver-550 nvidia-dkms"
        );
        assert_eq!(calls[1].display(), "apt-get -y autoremove --purge");
        assert!(calls.iter().all(|c| c.elevated));
    }

    #[test]
    fn test_arch_and_suse_flags() {
        let exec: Arc<dyn CommandExecutor> = Arc::new(FakeExecutor::new());
        let pkgs = names(&["nvidia"]);

        let arch = CommandPackageManager::new(DistroFamily::Arch, exec.clone()).unwrap();
        let cmds = arch.remove_commands(&pkgs, &RemoveOptions::default());
        assert_eq!(cmds[0].display(), "pacman -Rn --noconfirm nvidia");

        let suse = CommandPackageManager::new(DistroFamily::Suse, exec).unwrap();
        let cmds = suse.remove_commands(
            &pkgs,
            &RemoveOptions {
                purge: false,
                auto_remove: true,
                assume_yes: true,
            },
        );
        assert_eq!(cmds[0].display(), "zypper --non-interactive remove --clean-deps nvidia");
    }

    #[test]
    fn test_remove_rejects_bad_names_before_running() {
        let exec = Arc::new(FakeExecutor::new());
        let pm = CommandPackageManager::new(DistroFamily::RedHat, exec.clone()).unwrap();
        let err = pm
            .remove(&names(&["nvidia; reboot"]), &RemoveOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("invalid package name"));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_remove_failure_surfaces_stderr() {
        let exec = FakeExecutor::new().respond(
            "dnf",
            CommandOutput::with_exit_code(1).with_stderr("No match for argument: nvidia-x"),
        );
        let pm = CommandPackageManager::new(DistroFamily::RedHat, Arc::new(exec)).unwrap();
        let err = pm
            .remove(&names(&["nvidia-x"]), &RemoveOptions::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("No match"));
    }
}
