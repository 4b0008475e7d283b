//! Recording test doubles for every collaborator trait
//!
//! All fakes share one `Journal`, so a test can assert on the exact
//! interleaving of host commands, guest commands and waits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::guest::{GuestSession, Monitor, Vm};
use crate::host::{Clock, CmdResult, HostExecutor};
use crate::params::Params;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One observed collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Host(String),
    Login(String),
    Guest { vm: String, command: String },
    EnterShell { vm: String, launcher: String },
    LeaveShell(String),
    CloseSession(String),
    Monitor { vm: String, command: String },
    Sleep(Duration),
    AliveCheck(String),
    Create(String),
    Destroy(String),
}

/// Shared, ordered record of events
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.0).clone()
    }

    /// Host commands in order
    pub fn host_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Host(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Guest commands in order, across all VMs
    pub fn guest_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Guest { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        lock(&self.0).iter().filter(|&e| pred(e)).count()
    }

    /// Position of the first event matching `pred`
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        lock(&self.0).iter().position(pred)
    }
}

/// Scripted behaviour for commands containing a substring
#[derive(Debug, Clone)]
struct Rule<R> {
    pattern: String,
    nth: Option<usize>,
    seen: usize,
    reply: R,
}

fn matching_reply<R: Clone>(rules: &mut [Rule<R>], command: &str) -> Option<R> {
    let mut reply = None;
    for rule in rules.iter_mut().filter(|r| command.contains(&r.pattern)) {
        rule.seen += 1;
        if reply.is_none() && rule.nth.is_none_or(|n| n == rule.seen) {
            reply = Some(rule.reply.clone());
        }
    }
    reply
}

/// Host executor answering from scripted rules; unmatched commands succeed silently
#[derive(Debug, Default)]
pub struct FakeHost {
    journal: Journal,
    rules: Mutex<Vec<Rule<CmdResult>>>,
}

impl FakeHost {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Answer commands containing `pattern` with `result`
    pub fn respond(&self, pattern: &str, result: CmdResult) -> &Self {
        lock(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            nth: None,
            seen: 0,
            reply: result,
        });
        self
    }

    /// Answer commands containing `pattern` with `stdout` and status 0
    pub fn stdout(&self, pattern: &str, stdout: &str) -> &Self {
        self.respond(
            pattern,
            CmdResult {
                exit_status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        )
    }

    /// Fail commands containing `pattern`
    pub fn fail(&self, pattern: &str, status: i32, stderr: &str) -> &Self {
        self.respond(
            pattern,
            CmdResult {
                exit_status: status,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        )
    }
}

#[async_trait]
impl HostExecutor for FakeHost {
    async fn run(&self, command: &str) -> Result<CmdResult> {
        self.journal.push(Event::Host(command.to_string()));
        Ok(matching_reply(&mut lock(&self.rules), command).unwrap_or_default())
    }
}

/// Clock that records waits and returns immediately
#[derive(Debug, Default)]
pub struct FakeClock {
    journal: Journal,
}

impl FakeClock {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl Clock for FakeClock {
    async fn sleep(&self, duration: Duration) {
        self.journal.push(Event::Sleep(duration));
    }
}

/// Scripted guest reply
#[derive(Debug, Clone)]
pub enum GuestReply {
    Output(String),
    Fail { status: i32, output: String },
    Timeout,
}

/// Monitor answering from a fixed table
#[derive(Debug, Default)]
pub struct FakeMonitor {
    vm: String,
    journal: Journal,
    replies: Mutex<HashMap<String, Value>>,
}

impl FakeMonitor {
    pub fn reply(&self, command: &str, value: Value) -> &Self {
        lock(&self.replies).insert(command.to_string(), value);
        self
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn execute(&self, command: &str, _arguments: Option<Value>) -> Result<Value> {
        self.journal.push(Event::Monitor {
            vm: self.vm.clone(),
            command: command.to_string(),
        });
        lock(&self.replies)
            .get(command)
            .cloned()
            .ok_or_else(|| Error::MonitorCommand {
                command: command.to_string(),
                class: "CommandNotFound".to_string(),
                desc: format!("The command {} has not been found", command),
            })
    }
}

/// VM whose guest answers from scripted rules; unmatched commands print nothing
pub struct FakeVm {
    name: String,
    journal: Journal,
    rules: Arc<Mutex<Vec<Rule<GuestReply>>>>,
    monitor: Arc<FakeMonitor>,
    alive: Mutex<bool>,
    login_fails: Mutex<bool>,
}

impl FakeVm {
    pub fn new(name: &str, journal: Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            rules: Arc::new(Mutex::new(Vec::new())),
            monitor: Arc::new(FakeMonitor {
                vm: name.to_string(),
                journal,
                replies: Mutex::new(HashMap::new()),
            }),
            alive: Mutex::new(true),
            login_fails: Mutex::new(false),
        }
    }

    fn add_rule(&self, pattern: &str, nth: Option<usize>, reply: GuestReply) -> &Self {
        lock(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            nth,
            seen: 0,
            reply,
        });
        self
    }

    /// Answer every guest command containing `pattern`
    pub fn on(&self, pattern: &str, reply: GuestReply) -> &Self {
        self.add_rule(pattern, None, reply)
    }

    /// Answer only the `nth` (1-based) guest command containing `pattern`
    pub fn on_nth(&self, pattern: &str, nth: usize, reply: GuestReply) -> &Self {
        self.add_rule(pattern, Some(nth), reply)
    }

    pub fn output(&self, pattern: &str, output: &str) -> &Self {
        self.on(pattern, GuestReply::Output(output.to_string()))
    }

    pub fn monitor_handle(&self) -> Arc<FakeMonitor> {
        self.monitor.clone()
    }

    pub fn set_alive(&self, alive: bool) {
        *lock(&self.alive) = alive;
    }

    pub fn set_login_fails(&self, fails: bool) {
        *lock(&self.login_fails) = fails;
    }
}

#[async_trait]
impl Vm for FakeVm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify_alive(&self) -> Result<()> {
        self.journal.push(Event::AliveCheck(self.name.clone()));
        if *lock(&self.alive) {
            Ok(())
        } else {
            Err(Error::VmDead {
                name: self.name.clone(),
                reason: "not running".to_string(),
            })
        }
    }

    async fn wait_for_login(&self, timeout: Duration) -> Result<Box<dyn GuestSession>> {
        self.journal.push(Event::Login(self.name.clone()));
        if *lock(&self.login_fails) {
            return Err(Error::LoginTimeout {
                name: self.name.clone(),
                secs: timeout.as_secs(),
            });
        }
        Ok(Box::new(FakeSession {
            vm: self.name.clone(),
            journal: self.journal.clone(),
            rules: self.rules.clone(),
            prompt: String::new(),
            closed: false,
        }))
    }

    fn monitor(&self) -> Result<Arc<dyn Monitor>> {
        Ok(self.monitor.clone())
    }

    async fn create(&self, _params: &Params) -> Result<()> {
        self.journal.push(Event::Create(self.name.clone()));
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.journal.push(Event::Destroy(self.name.clone()));
        Ok(())
    }
}

struct FakeSession {
    vm: String,
    journal: Journal,
    rules: Arc<Mutex<Vec<Rule<GuestReply>>>>,
    prompt: String,
    closed: bool,
}

impl FakeSession {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<(i32, String)> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.journal.push(Event::Guest {
            vm: self.vm.clone(),
            command: command.to_string(),
        });
        match matching_reply(&mut lock(&self.rules), command) {
            None => Ok((0, String::new())),
            Some(GuestReply::Output(out)) => Ok((0, out)),
            Some(GuestReply::Fail { status, output }) => Ok((status, output)),
            Some(GuestReply::Timeout) => Err(Error::timeout(command, timeout.as_secs())),
        }
    }
}

#[async_trait]
impl GuestSession for FakeSession {
    async fn cmd(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let (status, output) = self.exec(command, timeout)?;
        if status != 0 {
            return Err(Error::GuestCommand {
                command: command.to_string(),
                status,
                output,
            });
        }
        Ok(output)
    }

    async fn cmd_output(&mut self, command: &str, timeout: Duration) -> Result<String> {
        Ok(self.exec(command, timeout)?.1)
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn set_prompt(&mut self, prompt: &str) -> Result<()> {
        self.prompt = prompt.to_string();
        Ok(())
    }

    async fn enter_shell(&mut self, launcher: &str) -> Result<()> {
        self.journal.push(Event::EnterShell {
            vm: self.vm.clone(),
            launcher: launcher.to_string(),
        });
        Ok(())
    }

    async fn leave_shell(&mut self) -> Result<()> {
        self.journal.push(Event::LeaveShell(self.vm.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.journal.push(Event::CloseSession(self.vm.clone()));
        }
        Ok(())
    }
}
