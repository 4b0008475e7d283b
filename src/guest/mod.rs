//! VM and guest-session collaborators
//!
//! Scenarios reach VMs only through the `Vm` and `GuestSession` traits and
//! look them up in an explicit `TestEnv`, never through global state.

pub mod qmp;
pub mod shell;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::params::Params;

pub use qmp::{Monitor, SevInfo};
pub use shell::{ShellSession, ShellVm};

/// Timeout for guest commands issued without an explicit one
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// An open shell channel into a guest
#[async_trait]
pub trait GuestSession: Send {
    /// Run a command; a non-zero exit status or timeout is an error
    async fn cmd(&mut self, command: &str, timeout: Duration) -> Result<String>;

    /// Run a command and return its output whatever the exit status
    ///
    /// Timeouts are still errors.
    async fn cmd_output(&mut self, command: &str, timeout: Duration) -> Result<String>;

    /// Pattern matching the shell prompt
    fn prompt(&self) -> &str;

    /// Replace the prompt pattern
    fn set_prompt(&mut self, prompt: &str) -> Result<()>;

    /// Run subsequent commands inside a nested shell started by `launcher`
    async fn enter_shell(&mut self, launcher: &str) -> Result<()>;

    /// Leave the innermost nested shell
    async fn leave_shell(&mut self) -> Result<()>;

    /// Close the session; further commands fail
    async fn close(&mut self) -> Result<()>;
}

/// A VM under test
#[async_trait]
pub trait Vm: Send + Sync {
    fn name(&self) -> &str;

    /// Fail unless the VM process is running
    async fn verify_alive(&self) -> Result<()>;

    /// Open a guest session, retrying until `timeout` elapses
    async fn wait_for_login(&self, timeout: Duration) -> Result<Box<dyn GuestSession>>;

    /// Monitor channel of the VM
    fn monitor(&self) -> Result<Arc<dyn Monitor>>;

    /// Boot the VM; its definition may reference scenario parameters
    async fn create(&self, params: &Params) -> Result<()>;

    /// Stop the VM
    async fn destroy(&self) -> Result<()>;
}

/// VMs available to a scenario, by name
#[derive(Default, Clone)]
pub struct TestEnv {
    vms: BTreeMap<String, Arc<dyn Vm>>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vm: Arc<dyn Vm>) {
        self.vms.insert(vm.name().to_string(), vm);
    }

    /// Look up a VM by name
    pub fn get_vm(&self, name: &str) -> Result<Arc<dyn Vm>> {
        self.vms
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VmNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vms.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv")
            .field("vms", &self.vms.keys().collect::<Vec<_>>())
            .finish()
    }
}
