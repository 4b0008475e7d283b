//! CLI command definitions
//!
//! Defines the clap commands for the scenario CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario from a YAML file
    Run {
        /// Path to the YAML scenario file
        path: PathBuf,

        /// Verbose output
        #[arg(long, short)]
        verbose: bool,

        /// Write a detailed log to this file instead of the default log directory
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Harness configuration file (default: ~/.config/vt-scenarios/config.toml)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Validate a scenario file without running it
    Check {
        /// Path to the YAML scenario file
        path: PathBuf,
    },

    /// List the available scenario types
    List,
}
