//! Conforming fakes for the collaborator traits.
//!
//! Compiled for unit tests and behind the `test-utils` feature so the
//! integration tests under `tests/` can drive whole workflows without
//! touching the host.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;

use crate::context::ExecutionContext;
use crate::error::ExecError;
use crate::kmod::{KernelModuleManager, ModuleDetector};
use crate::package::{InstalledPackage, PackageManager, RemoveOptions};
use crate::process::{CommandExecutor, CommandOutput, CommandSpec};
use crate::step::{Step, StepResult};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type Predicate = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(&CommandSpec) -> std::result::Result<CommandOutput, ExecError> + Send + Sync>;

/// Records every command and answers from canned responses.
///
/// Resolution order: `fail_when` predicates (exit 1), then per-program
/// responses, then the handler, then plain success.
#[derive(Default)]
pub struct FakeExecutor {
    responses: HashMap<String, CommandOutput>,
    failures: Vec<Predicate>,
    handler: Option<Handler>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, program: impl Into<String>, output: CommandOutput) -> Self {
        self.responses.insert(program.into(), output);
        self
    }

    /// Exit 1 for every command matching `predicate`.
    pub fn fail_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.failures.push(Box::new(predicate));
        self
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> std::result::Result<CommandOutput, ExecError> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, program: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.program == program).count()
    }
}

impl CommandExecutor for FakeExecutor {
    fn execute(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, ExecError> {
        lock(&self.calls).push(spec.clone());
        if self.failures.iter().any(|p| p(spec)) {
            return Ok(CommandOutput::with_exit_code(1)
                .with_stderr(format!("simulated failure: {}", spec.display())));
        }
        if let Some(output) = self.responses.get(&spec.program) {
            return Ok(output.clone());
        }
        match &self.handler {
            Some(handler) => handler(spec),
            None => Ok(CommandOutput::ok()),
        }
    }
}

/// A module table and sysfs tree under a temp dir.
pub struct ModuleFixture {
    _temp: TempDir,
    proc_modules: PathBuf,
    sys_module: PathBuf,
}

impl ModuleFixture {
    /// # Panics
    ///
    /// If the temp dir cannot be written.
    pub fn new(table: &str) -> Self {
        let temp = TempDir::new().expect("creating module fixture dir");
        let proc_modules = temp.path().join("modules");
        let sys_module = temp.path().join("sys/module");
        fs::write(&proc_modules, table).expect("writing module table");
        fs::create_dir_all(&sys_module).expect("creating sys/module");
        Self {
            _temp: temp,
            proc_modules,
            sys_module,
        }
    }

    pub fn manager(&self) -> KernelModuleManager {
        KernelModuleManager::new().with_paths(&self.proc_modules, &self.sys_module)
    }

    /// An executor where a successful `modprobe -r` or `rmmod` drops the
    /// module from the fixture table.
    pub fn executor(&self) -> FakeExecutor {
        self.executor_with(|_| Ok(CommandOutput::ok()))
    }

    /// Like [`ModuleFixture::executor`], passing every other command to
    /// `other`.
    pub fn executor_with<F>(&self, other: F) -> FakeExecutor
    where
        F: Fn(&CommandSpec) -> std::result::Result<CommandOutput, ExecError> + Send + Sync + 'static,
    {
        let table = self.proc_modules.clone();
        FakeExecutor::new().with_handler(move |spec| {
            let unloading = (spec.program == "modprobe" && spec.args.first().map(String::as_str) == Some("-r"))
                || spec.program == "rmmod";
            if !unloading {
                return other(spec);
            }
            if let Some(name) = spec.args.last() {
                drop_module_line(&table, name).map_err(|e| ExecError::Unspecified(e.to_string()))?;
            }
            Ok(CommandOutput::ok())
        })
    }

    /// # Panics
    ///
    /// If the refcnt file cannot be written.
    pub fn set_refcnt(&self, name: &str, refcnt: u32) {
        let dir = self.sys_module.join(name);
        fs::create_dir_all(&dir).expect("creating module sysfs dir");
        fs::write(dir.join("refcnt"), format!("{}\n", refcnt)).expect("writing refcnt");
    }
}

fn drop_module_line(table: &Path, name: &str) -> std::io::Result<()> {
    let content = fs::read_to_string(table)?;
    let kept: String = content
        .lines()
        .filter(|line| line.split_whitespace().next() != Some(name))
        .map(|line| format!("{}\n", line))
        .collect();
    fs::write(table, kept)
}

type RemoveCallback = Box<dyn Fn(&[String]) + Send + Sync>;

/// In-memory package manager.
#[derive(Default)]
pub struct FakePackageManager {
    installed: Vec<InstalledPackage>,
    fail_on_call: Option<usize>,
    fail_all: bool,
    on_remove: Option<RemoveCallback>,
    remove_calls: Mutex<Vec<Vec<String>>>,
}

impl FakePackageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_installed(mut self, installed: Vec<InstalledPackage>) -> Self {
        self.installed = installed;
        self
    }

    /// Fail the `n`th remove call (1-based).
    pub fn fail_on_remove_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub fn fail_all_removals(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// Run `callback` on every remove call, before it succeeds or fails.
    pub fn on_remove<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.on_remove = Some(Box::new(callback));
        self
    }

    pub fn remove_calls(&self) -> Vec<Vec<String>> {
        lock(&self.remove_calls).clone()
    }
}

impl PackageManager for FakePackageManager {
    fn name(&self) -> &str {
        "fake"
    }

    fn list_installed(&self) -> Result<Vec<InstalledPackage>> {
        Ok(self.installed.clone())
    }

    fn remove(&self, packages: &[String], _options: &RemoveOptions) -> Result<()> {
        let call = {
            let mut calls = lock(&self.remove_calls);
            calls.push(packages.to_vec());
            calls.len()
        };
        if let Some(callback) = &self.on_remove {
            callback(packages);
        }
        if self.fail_all || self.fail_on_call == Some(call) {
            return Err(anyhow!("simulated removal failure: {}", packages.join(" ")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeModuleDetector {
    loaded: Vec<String>,
    secure_boot: Option<bool>,
}

impl FakeModuleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loaded<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.loaded = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_secure_boot(mut self, secure_boot: Option<bool>) -> Self {
        self.secure_boot = secure_boot;
        self
    }
}

impl ModuleDetector for FakeModuleDetector {
    fn is_loaded(&self, name: &str) -> Result<bool> {
        Ok(self.loaded.iter().any(|m| m == name))
    }

    fn loaded_modules(&self) -> Result<Vec<String>> {
        Ok(self.loaded.clone())
    }

    fn secure_boot_enabled(&self) -> Result<Option<bool>> {
        Ok(self.secure_boot)
    }
}

/// Shared, ordered log of step invocations (`execute:<name>`,
/// `rollback:<name>`).
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

type Action = Arc<dyn Fn(&ExecutionContext) -> StepResult + Send + Sync>;

/// A step whose behavior is set by the test. Clones share counters.
#[derive(Clone)]
pub struct ScriptedStep {
    name: String,
    validation_error: Option<String>,
    action: Action,
    reversible: bool,
    rollback_error: Option<String>,
    journal: Option<Journal>,
    executions: Arc<AtomicUsize>,
    rollbacks: Arc<AtomicUsize>,
}

impl ScriptedStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validation_error: None,
            action: Arc::new(|_| StepResult::completed("ok")),
            reversible: false,
            rollback_error: None,
            journal: None,
            executions: Arc::new(AtomicUsize::new(0)),
            rollbacks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_validation(mut self, message: impl Into<String>) -> Self {
        self.validation_error = Some(message.into());
        self
    }

    pub fn with_result<F>(self, result: F) -> Self
    where
        F: Fn() -> StepResult + Send + Sync + 'static,
    {
        self.with_action(move |_| result())
    }

    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&ExecutionContext) -> StepResult + Send + Sync + 'static,
    {
        self.action = Arc::new(action);
        self
    }

    pub fn fail_with(self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.with_action(move |_| StepResult::failed(anyhow!("{}", message)))
    }

    /// Fail after leaving reversible partial effects behind.
    pub fn fail_with_rollback(self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.with_action(move |_| StepResult::failed(anyhow!("{}", message)).with_rollback(true))
    }

    pub fn reversible(mut self) -> Self {
        self.reversible = true;
        self
    }

    pub fn fail_rollback(mut self, message: impl Into<String>) -> Self {
        self.rollback_error = Some(message.into());
        self
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Some(journal.clone());
        self
    }

    pub fn execute_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test step"
    }

    fn validate(&self, _ctx: &ExecutionContext) -> Result<()> {
        match &self.validation_error {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record(format!("execute:{}", self.name));
        }
        let result = (self.action)(ctx);
        if result.status == crate::step::StepStatus::Completed {
            result.with_rollback(self.reversible)
        } else {
            result
        }
    }

    fn rollback(&self, _ctx: &ExecutionContext) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record(format!("rollback:{}", self.name));
        }
        match &self.rollback_error {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    fn can_rollback(&self) -> bool {
        self.reversible
    }
}
