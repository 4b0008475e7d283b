//! Host-side collaborators: shell command execution and sleeping
//!
//! Host commands never raise on a non-zero exit status; callers inspect
//! `CmdResult` and decide whether the failure matters.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::common::{Error, Result};
use crate::outcome::Outcome;

/// Captured result of a host command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// Exit status; -1 when the process was killed by a signal
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Convert a non-zero exit into a host command error
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::host_command(command, self.exit_status, &self.stderr))
        }
    }
}

/// Runs shell commands on the host
#[async_trait]
pub trait HostExecutor: Send + Sync {
    /// Run `command` through the shell and capture its output
    ///
    /// Only failures to start the shell are errors.
    async fn run(&self, command: &str) -> Result<CmdResult>;
}

/// Run a host command whose failure is observational only
///
/// A non-zero exit, or a failure to spawn, comes back as `Outcome::Logged`.
pub async fn run_logged(host: &dyn HostExecutor, command: &str) -> Outcome<CmdResult> {
    match host.run(command).await {
        Ok(result) if result.success() => Outcome::Done(result),
        Ok(result) => Outcome::Logged(Error::host_command(
            command,
            result.exit_status,
            &result.stderr,
        )),
        Err(e) => Outcome::Logged(e),
    }
}

/// Run a host command whose failure ends the scenario
pub async fn run_checked(host: &dyn HostExecutor, command: &str) -> Result<CmdResult> {
    host.run(command).await?.check(command)
}

/// `HostExecutor` backed by `<shell> -c <command>`
#[derive(Debug, Clone)]
pub struct ShellHost {
    shell: PathBuf,
}

impl ShellHost {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellHost {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl HostExecutor for ShellHost {
    async fn run(&self, command: &str) -> Result<CmdResult> {
        tracing::debug!(command, "Running host command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: self.shell.display().to_string(),
                source,
            })?;

        let result = CmdResult {
            exit_status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(command, status = result.exit_status, "Host command finished");
        Ok(result)
    }
}

/// Source of waits, so scenario timing can be observed in tests
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// `Clock` backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
