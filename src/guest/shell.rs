//! Guest access through a host command prefix
//!
//! A VM is reached by prepending its `login` prefix (typically an `ssh`
//! invocation) to each guest command and running the result on the host.
//! Every guest command is a separate host process, so a "session" is the
//! prefix plus the prompt and nested-shell state layered on top of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;

use super::{GuestSession, Monitor, Vm};
use crate::common::config::{GuestConfig, VmSpec};
use crate::common::{Error, Result};
use crate::host::{run_checked, HostExecutor};
use crate::params::Params;

/// VM described by host commands
pub struct ShellVm {
    name: String,
    spec: VmSpec,
    guest: GuestConfig,
    host: Arc<dyn HostExecutor>,
}

impl ShellVm {
    pub fn new(
        name: impl Into<String>,
        spec: VmSpec,
        guest: GuestConfig,
        host: Arc<dyn HostExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            guest,
            host,
        }
    }

    fn open_session(&self) -> ShellSession {
        ShellSession::new(self.spec.login.clone(), self.host.clone())
    }
}

#[async_trait]
impl Vm for ShellVm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify_alive(&self) -> Result<()> {
        let Some(check) = &self.spec.alive_check else {
            return Ok(());
        };
        let result = self.host.run(check).await?;
        if result.success() {
            Ok(())
        } else {
            Err(Error::VmDead {
                name: self.name.clone(),
                reason: format!("'{}' exited with status {}", check, result.exit_status),
            })
        }
    }

    async fn wait_for_login(&self, timeout: Duration) -> Result<Box<dyn GuestSession>> {
        tracing::debug!(vm = %self.name, timeout_secs = timeout.as_secs(), "Logging into guest");

        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.guest.poll_interval_ms);
        let mut checker = self.open_session();

        loop {
            let attempt = tokio::time::timeout(
                deadline.saturating_duration_since(Instant::now()),
                checker.cmd(&self.guest.login_check, timeout),
            )
            .await;

            match attempt {
                Ok(Ok(_)) => {
                    tracing::debug!(vm = %self.name, "Guest login succeeded");
                    return Ok(Box::new(self.open_session()));
                }
                Ok(Err(e)) => tracing::trace!(vm = %self.name, "Login attempt failed: {}", e),
                Err(_) => {}
            }

            if Instant::now() + poll >= deadline {
                return Err(Error::LoginTimeout {
                    name: self.name.clone(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn monitor(&self) -> Result<Arc<dyn Monitor>> {
        #[cfg(unix)]
        {
            if let Some(path) = &self.spec.monitor {
                return Ok(Arc::new(super::qmp::QmpMonitor::new(path.clone())));
            }
        }
        Err(Error::NoMonitor(self.name.clone()))
    }

    async fn create(&self, params: &Params) -> Result<()> {
        let Some(create) = &self.spec.create else {
            return Err(Error::Config(format!(
                "VM '{}' has no create command",
                self.name
            )));
        };
        let command = params.expand(&format!("vms.{}.create", self.name), create)?;
        tracing::info!(vm = %self.name, "Creating VM");
        run_checked(self.host.as_ref(), &command).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let Some(destroy) = &self.spec.destroy else {
            tracing::warn!(vm = %self.name, "No destroy command configured, leaving VM running");
            return Ok(());
        };
        tracing::info!(vm = %self.name, "Destroying VM");
        run_checked(self.host.as_ref(), destroy).await?;
        Ok(())
    }
}

/// Session over a login prefix
pub struct ShellSession {
    login: String,
    host: Arc<dyn HostExecutor>,
    prompt: String,
    prompt_tail: Option<Regex>,
    shells: Vec<String>,
    closed: bool,
}

impl ShellSession {
    pub fn new(login: impl Into<String>, host: Arc<dyn HostExecutor>) -> Self {
        Self {
            login: login.into(),
            host,
            prompt: String::new(),
            prompt_tail: None,
            shells: Vec::new(),
            closed: false,
        }
    }

    /// Host command line that runs `command` in the guest
    ///
    /// Each entered shell wraps the command as `<launcher> -c <quoted>`.
    pub fn wrap(&self, command: &str) -> Result<String> {
        let mut inner = command.to_string();
        for launcher in self.shells.iter().rev() {
            inner = format!("{} -c {}", launcher, shlex::try_quote(&inner)?);
        }
        Ok(format!("{} {}", self.login, shlex::try_quote(&inner)?))
    }

    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<(i32, String)> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let wrapped = self.wrap(command)?;
        tracing::debug!(command, "Sending guest command");

        let result = tokio::time::timeout(timeout, self.host.run(&wrapped))
            .await
            .map_err(|_| Error::timeout(command, timeout.as_secs()))??;

        let mut output = result.stdout;
        output.push_str(&result.stderr);
        Ok((result.exit_status, self.strip_prompt(output)))
    }

    fn strip_prompt(&self, mut output: String) -> String {
        if let Some(tail) = &self.prompt_tail {
            if let Some(m) = tail.find(&output) {
                output.truncate(m.start());
            }
        }
        output
    }
}

#[async_trait]
impl GuestSession for ShellSession {
    async fn cmd(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let (status, output) = self.exec(command, timeout).await?;
        if status != 0 {
            return Err(Error::GuestCommand {
                command: command.to_string(),
                status,
                output: output.trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn cmd_output(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let (status, output) = self.exec(command, timeout).await?;
        if status != 0 {
            tracing::debug!(command, status, "Guest command exited non-zero");
        }
        Ok(output)
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn set_prompt(&mut self, prompt: &str) -> Result<()> {
        self.prompt_tail = if prompt.is_empty() {
            None
        } else {
            // Only a prompt left at the very end of the output is stripped.
            let anchored = if prompt.ends_with('$') {
                prompt.to_string()
            } else {
                format!("(?:{})$", prompt)
            };
            Some(Regex::new(&anchored)?)
        };
        self.prompt = prompt.to_string();
        Ok(())
    }

    async fn enter_shell(&mut self, launcher: &str) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        tracing::debug!(launcher, "Entering nested guest shell");
        self.shells.push(launcher.to_string());
        Ok(())
    }

    async fn leave_shell(&mut self) -> Result<()> {
        self.shells.pop();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.shells.clear();
        Ok(())
    }
}
