use std::io::stderr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

use driver_lifecycle::config::{load_config, LifecycleConfig};
use driver_lifecycle::context::{CancellationToken, CoreContext, ExecutionContext};
use driver_lifecycle::distro::{DistroFamily, Distribution};
use driver_lifecycle::elevation::{Elevator, SudoElevator};
use driver_lifecycle::kmod::{KernelModuleManager, SysfsModuleDetector, DEFAULT_VENDOR_MODULES};
use driver_lifecycle::orchestrator::Orchestrator;
use driver_lifecycle::package::{CommandPackageManager, PackageDiscovery};
use driver_lifecycle::process::{CommandExecutor, SystemExecutor};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Default)]
struct UninstallArgs {
    config: Option<PathBuf>,
    dry_run: bool,
    force: bool,
}

fn usage() -> &'static str {
    "Usage:\n  driver-lifecycle uninstall [--config FILE] [--dry-run] [--force]\n  driver-lifecycle discover\n  driver-lifecycle modules"
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, rest @ ..] if cmd == "uninstall" => uninstall(parse_uninstall_args(rest)?),
        [cmd] if cmd == "discover" => discover(),
        [cmd] if cmd == "modules" => modules(),
        _ => bail!(usage()),
    }
}

fn parse_uninstall_args(args: &[String]) -> Result<UninstallArgs> {
    let mut parsed = UninstallArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dry-run" => parsed.dry_run = true,
            "--force" => parsed.force = true,
            "--config" => {
                let path = iter
                    .next()
                    .with_context(|| format!("--config needs a file\n{}", usage()))?;
                parsed.config = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument '{}'\n{}", other, usage()),
        }
    }
    Ok(parsed)
}

fn uninstall(args: UninstallArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => LifecycleConfig::default(),
    };
    let dry_run = args.dry_run || config.general.dry_run;
    let force = args.force || config.general.force;

    let distribution = Distribution::detect()?;
    info!(distro = %distribution.name, family = %distribution.family, "detected distribution");

    let elevator: Option<Arc<dyn Elevator>> = match SudoElevator::detect() {
        Ok(elevator) => Some(Arc::new(elevator)),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "no elevation available");
            None
        }
    };
    let executor = system_executor(elevator.clone());

    let token = CancellationToken::new();
    install_interrupt_handler(token.clone());

    let mut core = CoreContext::new(executor.clone())
        .with_dry_run(dry_run)
        .with_force(force)
        .with_cancellation(token);
    if let Some(elevator) = elevator {
        core = core.with_elevator(elevator);
    }

    let mut ctx = ExecutionContext::new(core, distribution.clone())
        .with_module_detector(Arc::new(SysfsModuleDetector::new()));
    match CommandPackageManager::new(distribution.family, executor) {
        Ok(pm) => ctx = ctx.with_package_manager(Arc::new(pm)),
        Err(e) => warn!(error = %format!("{:#}", e), "package removal unavailable"),
    }

    let mut orchestrator =
        Orchestrator::new(config.uninstall_workflow()?).with_options(config.orchestrator_options());
    orchestrator.on_complete(|report| eprint!("{}", report.summary()));

    let report = orchestrator.execute(&ctx);
    println!("{}", report.to_json()?);

    if !report.is_success() {
        bail!("uninstall {}", report.status);
    }
    Ok(())
}

fn discover() -> Result<()> {
    let distribution = Distribution::detect()?;
    if distribution.family == DistroFamily::Unknown {
        bail!(
            "unsupported distribution '{}'; cannot list installed packages",
            distribution.id
        );
    }
    let pm = CommandPackageManager::new(distribution.family, system_executor(None))?;
    let discovered = PackageDiscovery::new(distribution.family)?.discover_from(&pm)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&discovered).context("serializing discovered packages")?
    );
    Ok(())
}

fn modules() -> Result<()> {
    let manager = KernelModuleManager::new();
    let loaded: Vec<_> = manager
        .list()?
        .into_iter()
        .filter(|m| DEFAULT_VENDOR_MODULES.contains(&m.name.as_str()))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&loaded).context("serializing module table")?
    );
    Ok(())
}

fn system_executor(elevator: Option<Arc<dyn Elevator>>) -> Arc<dyn CommandExecutor> {
    match elevator {
        Some(elevator) => Arc::new(SystemExecutor::new().with_elevator(elevator)),
        None => Arc::new(SystemExecutor::new()),
    }
}

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Turn SIGINT/SIGTERM into cooperative cancellation.
fn install_interrupt_handler(token: CancellationToken) {
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
    thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            warn!("interrupted, stopping after the current operation");
            token.cancel();
            return;
        }
        thread::sleep(Duration::from_millis(100));
    });
}
