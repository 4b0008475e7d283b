//! Logging and tracing configuration
//!
//! The CLI always logs to stdout. A scenario run can additionally write a
//! detailed log file so the command trail survives the terminal session.

use std::path::{Path, PathBuf};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use super::paths;

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vt_scenarios=info,warn"))
}

/// Initialize tracing for the CLI (stdout logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for a scenario run (stdout + log file)
///
/// The file receives every event with source locations and span
/// enter/exit markers; stdout stays compact. Falls back to stdout only
/// when the file cannot be opened. Returns the path actually used.
pub fn init_run(log_file: Option<&Path>, scenario: &str) -> Option<PathBuf> {
    let path = match log_file {
        Some(p) => Some(p.to_path_buf()),
        None => paths::ensure_log_dir()
            .ok()
            .flatten()
            .and_then(|_| paths::run_log_path(scenario)),
    };

    if let Some(path) = path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => {
                let file_layer = fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);

                let stdout_layer = fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact();

                tracing_subscriber::registry()
                    .with(default_filter())
                    .with(file_layer)
                    .with(stdout_layer)
                    .init();

                return Some(path);
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {}: {}", path.display(), e);
            }
        }
    }

    init_cli();
    None
}
