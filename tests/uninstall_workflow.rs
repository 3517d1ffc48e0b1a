//! End-to-end uninstall runs against fake collaborators and a temp `/etc`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use driver_lifecycle::context::{keys, CancellationToken, CoreContext, ExecutionContext};
use driver_lifecycle::distro::{DistroFamily, Distribution};
use driver_lifecycle::elevation::SudoElevator;
use driver_lifecycle::error::ExecError;
use driver_lifecycle::kmod::RetryPolicy;
use driver_lifecycle::orchestrator::{ErrorPolicy, Orchestrator, OrchestratorOptions};
use driver_lifecycle::package::InstalledPackage;
use driver_lifecycle::process::{CommandOutput, CommandSpec};
use driver_lifecycle::report::{EventKind, ReportStatus};
use driver_lifecycle::steps::{
    ConfigCleanupStep, DriverRestoreStep, ModuleUnloadStep, PackageRemovalStep, PreflightStep,
};
use driver_lifecycle::testing::{FakeExecutor, FakePackageManager, ModuleFixture};
use driver_lifecycle::workflow::Workflow;
use tempfile::TempDir;

const MODULES: &str = "\
nvidia_drm 126976 4 - Live 0x0
nvidia_modeset 1314816 2 nvidia_drm, Live 0x0
nvidia 55123456 10 nvidia_modeset, Live 0x0
snd_hda_intel 61440 3 - Live 0x0
";

const NVIDIA_CONF: &str = "options nvidia-drm modeset=1\n";
const BLACKLIST: &str = "blacklist nouveau\noptions nouveau modeset=0\n";

struct Host {
    temp: TempDir,
    modules: ModuleFixture,
}

impl Host {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let modprobe_d = temp.path().join("etc/modprobe.d");
        fs::create_dir_all(&modprobe_d).unwrap();
        fs::write(modprobe_d.join("nvidia.conf"), NVIDIA_CONF).unwrap();
        fs::write(modprobe_d.join("blacklist-nouveau.conf"), BLACKLIST).unwrap();
        Self {
            temp,
            modules: ModuleFixture::new(MODULES),
        }
    }

    fn etc(&self) -> PathBuf {
        self.temp.path().join("etc")
    }

    fn nvidia_conf(&self) -> PathBuf {
        self.etc().join("modprobe.d/nvidia.conf")
    }

    fn blacklist(&self) -> PathBuf {
        self.etc().join("modprobe.d/blacklist-nouveau.conf")
    }

    /// Executor that really applies `rm`/`tee` and module unloads to the
    /// fixture, and fails any command matching `fail`.
    fn executor(&self, fail: impl Fn(&CommandSpec) -> bool + Send + Sync + 'static) -> Arc<FakeExecutor> {
        Arc::new(self.modules.executor_with(apply_file_command).fail_when(fail))
    }

    fn workflow(&self, batch_size: i64) -> Workflow {
        let modprobe_d = self.etc().join("modprobe.d");
        let mut workflow = Workflow::new("uninstall");
        workflow
            .add_step(PreflightStep::new().with_lookup(|_| true))
            .unwrap();
        workflow
            .add_step(
                ModuleUnloadStep::default()
                    .with_manager(self.modules.manager())
                    .with_retry(RetryPolicy {
                        max_retries: 1,
                        delay: Duration::ZERO,
                    }),
            )
            .unwrap();
        workflow
            .add_step(PackageRemovalStep::discovered().with_batch_size(batch_size))
            .unwrap();
        workflow
            .add_step(
                ConfigCleanupStep::new(self.temp.path().join("backups"))
                    .only_paths([self.nvidia_conf()])
                    .with_allowed_roots([self.etc()])
                    .with_scan_dirs([modprobe_d.clone()]),
            )
            .unwrap();
        workflow
            .add_step(
                DriverRestoreStep::new()
                    .with_blacklist_paths([self.blacklist()])
                    .with_blacklist_roots([modprobe_d]),
            )
            .unwrap();
        workflow
    }
}

fn apply_file_command(spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
    let target = spec.args.last().map(Path::new);
    match (spec.program.as_str(), target) {
        ("rm", Some(path)) => {
            let _ = fs::remove_file(path);
        }
        ("tee", Some(path)) => {
            fs::write(path, spec.stdin.clone().unwrap_or_default())
                .map_err(|e| ExecError::Unspecified(e.to_string()))?;
        }
        _ => {}
    }
    Ok(CommandOutput::ok())
}

fn installed() -> Vec<InstalledPackage> {
    vec![
        InstalledPackage::new("nvidia-driver-550").with_version("550.120-0ubuntu1"),
        InstalledPackage::new("vim"),
        InstalledPackage::new("libnvidia-gl-550"),
        InstalledPackage::new("nvidia-dkms-550"),
    ]
}

fn context(exec: Arc<FakeExecutor>, pm: Arc<FakePackageManager>) -> ExecutionContext {
    ExecutionContext::new(
        CoreContext::new(exec).with_elevator(Arc::new(SudoElevator::privileged())),
        Distribution::from_family(DistroFamily::Debian),
    )
    .with_package_manager(pm)
}

#[test]
fn test_full_uninstall_then_rollback() {
    let host = Host::new();
    let exec = host.executor(|_| false);
    let pm = Arc::new(FakePackageManager::new().with_installed(installed()));
    let ctx = context(exec.clone(), pm.clone());

    let mut orchestrator = Orchestrator::new(host.workflow(0));
    let report = orchestrator.execute(&ctx);

    assert_eq!(report.status, ReportStatus::Completed, "{}", report.summary());
    assert_eq!(
        report.completed_steps,
        vec![
            "preflight",
            "module-unload",
            "package-removal",
            "config-cleanup",
            "driver-restore",
        ]
    );
    assert_eq!(report.unloaded_modules, vec!["nvidia_drm", "nvidia_modeset", "nvidia"]);
    assert_eq!(report.removed_packages.len(), 3);
    assert!(!report.removed_packages.contains(&"vim".to_string()));
    assert_eq!(report.removed_configs, vec![host.nvidia_conf()]);
    assert!(report.reboot_required);
    assert!(report.driver_restored);
    assert!(!host.nvidia_conf().exists());
    assert!(!host.blacklist().exists());
    assert_eq!(pm.remove_calls().len(), 1);

    orchestrator.workflow().rollback(&ctx).unwrap();
    assert_eq!(fs::read_to_string(host.nvidia_conf()).unwrap(), NVIDIA_CONF);
    assert_eq!(fs::read_to_string(host.blacklist()).unwrap(), BLACKLIST);
    let reloads: Vec<String> = exec
        .calls()
        .into_iter()
        .filter(|c| c.program == "modprobe" && c.args.len() == 1)
        .map(|c| c.args[0].clone())
        .collect();
    // Fallback load first, then the vendor modules base-first.
    assert_eq!(reloads, vec!["nouveau", "nvidia", "nvidia_modeset", "nvidia_drm"]);
}

#[test]
fn test_boot_image_failure_rolls_back_earlier_steps() {
    let host = Host::new();
    let exec = host.executor(|spec| spec.program == "update-initramfs");
    let pm = Arc::new(FakePackageManager::new().with_installed(installed()));
    let ctx = context(exec.clone(), pm);

    let mut orchestrator = Orchestrator::new(host.workflow(0)).with_options(OrchestratorOptions {
        error_policy: ErrorPolicy::StopOnError,
        rollback_on_failure: true,
    });
    let report = orchestrator.execute(&ctx);

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.failed_step.as_deref(), Some("driver-restore"));
    assert!(report.rolled_back);
    assert!(report.rollback_errors.is_empty(), "{:?}", report.rollback_errors);
    // Top-level facts describe the host after rollback; undone effects move aside.
    assert!(report.unloaded_modules.is_empty());
    assert!(report.removed_configs.is_empty());
    assert_eq!(
        report.reverted.unloaded_modules,
        vec!["nvidia_drm", "nvidia_modeset", "nvidia"]
    );
    assert_eq!(report.reverted.removed_configs, vec![host.nvidia_conf()]);
    assert_eq!(report.removed_packages.len(), 3);
    let restores: Vec<CommandSpec> = exec
        .calls()
        .into_iter()
        .filter(|c| c.program == "tee")
        .collect();
    assert!(restores.iter().all(|c| c.elevated));
    assert!(restores
        .iter()
        .any(|c| c.args.last() == Some(&host.nvidia_conf().to_string_lossy().into_owned())));

    assert_eq!(fs::read_to_string(host.nvidia_conf()).unwrap(), NVIDIA_CONF);
    assert_eq!(fs::read_to_string(host.blacklist()).unwrap(), BLACKLIST);
    assert_eq!(exec.call_count("update-initramfs"), 1);
    assert!(!ctx.state().contains(keys::UNLOADED_MODULES));
}

#[test]
fn test_partial_package_removal_is_reported() {
    let host = Host::new();
    let exec = host.executor(|_| false);
    let pm = Arc::new(
        FakePackageManager::new()
            .with_installed(installed())
            .fail_on_remove_call(2),
    );
    let ctx = context(exec, pm.clone());

    let mut orchestrator = Orchestrator::new(host.workflow(1));
    let report = orchestrator.execute(&ctx);

    assert_eq!(report.status, ReportStatus::Partial, "{}", report.summary());
    assert!(report.is_success());
    assert_eq!(pm.remove_calls().len(), 3);
    assert_eq!(report.removed_packages.len(), 2);
    assert_eq!(report.failed_packages.len(), 1);
    assert!(report.summary().contains("failed packages"));
}

#[test]
fn test_cancellation_during_removal_stops_workflow() {
    let host = Host::new();
    let token = CancellationToken::new();
    let cancel = token.clone();
    let pm = Arc::new(
        FakePackageManager::new()
            .with_installed(installed())
            .on_remove(move |_| cancel.cancel()),
    );
    let exec = host.executor(|_| false);
    let ctx = ExecutionContext::new(
        CoreContext::new(exec)
            .with_elevator(Arc::new(SudoElevator::privileged()))
            .with_cancellation(token),
        Distribution::from_family(DistroFamily::Debian),
    )
    .with_package_manager(pm.clone());

    let mut orchestrator = Orchestrator::new(host.workflow(1));
    let report = orchestrator.execute(&ctx);

    assert_eq!(report.status, ReportStatus::Cancelled);
    assert_eq!(report.completed_steps, vec!["preflight", "module-unload"]);
    assert_eq!(pm.remove_calls().len(), 1);
    assert_eq!(report.removed_packages.len(), 1);
    assert_eq!(report.failed_packages.len(), 2);
    // Later steps never ran.
    assert!(host.nvidia_conf().exists());
    assert!(host.blacklist().exists());
    assert!(report.events.iter().any(|e| e.kind == EventKind::Cancelled));
}

#[test]
fn test_dry_run_leaves_host_untouched() {
    let host = Host::new();
    let exec = host.executor(|_| false);
    let pm = Arc::new(FakePackageManager::new().with_installed(installed()));
    let ctx = ExecutionContext::new(
        CoreContext::new(exec.clone()).with_dry_run(true),
        Distribution::from_family(DistroFamily::Debian),
    )
    .with_package_manager(pm.clone());

    let mut orchestrator = Orchestrator::new(host.workflow(0));
    let report = orchestrator.execute(&ctx);

    assert_eq!(report.status, ReportStatus::Completed, "{}", report.summary());
    assert!(report.dry_run);
    assert!(exec.calls().is_empty());
    assert!(pm.remove_calls().is_empty());
    assert!(host.nvidia_conf().exists());
    assert!(host.blacklist().exists());
    assert!(!host.temp.path().join("backups").exists());
    assert!(report.unloaded_modules.is_empty());
    assert!(!report.reboot_required);
}
