//! External command execution.
//!
//! The lifecycle engine never spawns processes directly. Every OS command goes
//! through a [`CommandExecutor`], so tests can substitute a fake and the real
//! [`SystemExecutor`] can apply privilege elevation and per-command timeouts
//! in one place.
//!
//! # Example
//!
//! ```rust,ignore
//! use driver_lifecycle::process::{CommandExecutor, CommandSpec, SystemExecutor};
//! use std::time::Duration;
//!
//! let exec = SystemExecutor::new();
//! let out = exec.execute(
//!     &CommandSpec::new("modprobe")
//!         .args(["-r", "nvidia_drm"])
//!         .elevated()
//!         .timeout(Duration::from_secs(30)),
//! )?;
//! if !out.success() {
//!     eprintln!("modprobe failed: {}", out.stderr_trimmed());
//! }
//! ```

use anyhow::{bail, Result};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::elevation::Elevator;
use crate::error::ExecError;

/// How often a running child is polled while waiting on a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A command to run: program, arguments, optional stdin, elevation and timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    /// Run with elevated privileges (no-op when already privileged).
    pub elevated: bool,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            stdin: None,
            elevated: false,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-like rendering for log lines. Not for execution.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 if the process was terminated by a signal.
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    /// A successful, empty output. Mostly useful for fakes.
    pub fn ok() -> Self {
        Self::with_exit_code(0)
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
            duration: Duration::ZERO,
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }

    /// Turn a non-zero exit into an error carrying stderr.
    pub fn ensure_success(self, what: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let stderr = self.stderr_trimmed();
        if stderr.is_empty() {
            bail!("{} (exit code {})", what, self.exit_code);
        }
        bail!("{} (exit code {}):\n{}", what, self.exit_code, stderr);
    }
}

/// Process execution collaborator.
pub trait CommandExecutor: Send + Sync {
    /// Run `spec` to completion. Non-zero exits are returned as data.
    fn execute(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, ExecError>;
}

/// Executor backed by `std::process::Command`.
#[derive(Clone, Default)]
pub struct SystemExecutor {
    elevator: Option<Arc<dyn Elevator>>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self { elevator: None }
    }

    /// Use `elevator` for commands marked [`CommandSpec::elevated`].
    pub fn with_elevator(mut self, elevator: Arc<dyn Elevator>) -> Self {
        self.elevator = Some(elevator);
        self
    }

    /// Resolve program, args and (for elevated calls) a replacement environment.
    fn resolve(&self, spec: &CommandSpec) -> (String, Vec<String>, Option<Vec<(String, String)>>) {
        if spec.elevated {
            if let Some(elevator) = self.elevator.as_ref().filter(|e| !e.is_privileged()) {
                let (program, args) = elevator.elevate(&spec.program, &spec.args);
                return (program, args, Some(elevator.sanitized_env()));
            }
        }
        (spec.program.clone(), spec.args.clone(), None)
    }
}

impl std::fmt::Debug for SystemExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemExecutor")
            .field("elevator", &self.elevator.is_some())
            .finish()
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, ExecError> {
        let (program, args, env) = self.resolve(spec);
        debug!(command = %spec.display(), elevated = spec.elevated, "executing");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(env) = env {
            cmd.env_clear();
            cmd.envs(env);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| ExecError::ExecutionFailed {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        if let (Some(input), Some(mut pipe)) = (spec.stdin.as_ref(), child.stdin.take()) {
            // A child that exits without reading stdin closes the pipe; that is not our failure.
            if let Err(e) = pipe.write_all(input) {
                warn!(command = %spec.program, error = %e, "writing stdin failed");
            }
        }

        let status = wait_with_timeout(&mut child, spec.timeout, start).map_err(|e| {
            ExecError::ExecutionFailed {
                program: spec.program.clone(),
                message: e.to_string(),
            }
        })?;

        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);

        match status {
            Some(status) => Ok(CommandOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
                duration: start.elapsed(),
            }),
            None => Err(ExecError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout.unwrap_or_default(),
            }),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Wait for `child`, killing it once `timeout` elapses. `Ok(None)` means timed out.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    start: Instant,
) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
