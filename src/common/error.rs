//! Error types for the scenario runner
//!
//! Messages name the command or parameter involved so a failed run can be
//! diagnosed from the log alone.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for scenarios and their collaborators
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Missing required parameter '{0}'")]
    MissingParam(String),

    #[error("Invalid value for parameter '{key}': '{value}' ({reason})")]
    InvalidParam {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Template '{key}' expects {expected} argument(s), got {got}")]
    TemplateArity {
        key: String,
        expected: usize,
        got: usize,
    },

    #[error("Template '{key}' references unknown parameter '${{{reference}}}'")]
    UnresolvedReference { key: String, reference: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === Environment Errors ===
    #[error("VM '{0}' is not defined in the test environment")]
    VmNotFound(String),

    #[error("VM '{name}' is not alive: {reason}")]
    VmDead { name: String, reason: String },

    #[error("Login to VM '{name}' timed out after {secs} seconds")]
    LoginTimeout { name: String, secs: u64 },

    #[error("VM '{0}' has no monitor configured")]
    NoMonitor(String),

    // === Command Errors ===
    #[error("Guest command '{command}' failed with status {status}: {output}")]
    GuestCommand {
        command: String,
        status: i32,
        output: String,
    },

    #[error("Host command '{command}' failed with status {status}: {stderr}")]
    HostCommand {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot quote command for the guest shell: {0}")]
    Quote(#[from] shlex::QuoteError),

    // === Monitor Errors ===
    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Monitor command '{command}' failed: {class}: {desc}")]
    MonitorCommand {
        command: String,
        class: String,
        desc: String,
    },

    // === Test Verdicts ===
    #[error("{0}")]
    TestFail(String),

    #[error("{0}")]
    TestError(String),

    #[error("{0}")]
    TestCancel(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Create an invalid parameter error
    pub fn invalid_param(key: &str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidParam {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a host command error from its captured stderr
    pub fn host_command(command: &str, status: i32, stderr: &str) -> Self {
        Self::HostCommand {
            command: command.to_string(),
            status,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(command: &str, secs: u64) -> Self {
        Self::Timeout {
            command: command.to_string(),
            secs,
        }
    }

    /// Whether this error comes from invalid scenario configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::MissingParam(_)
                | Error::InvalidParam { .. }
                | Error::TemplateArity { .. }
                | Error::UnresolvedReference { .. }
                | Error::Config(_)
                | Error::ConfigParse(_)
                | Error::Regex(_)
        )
    }
}
