//! Scenario runner
//!
//! Reads YAML scenario files, builds the VM registry from the harness
//! configuration and runs the named scenario, mapping its result to a
//! verdict. `fakes` provides recording collaborators for driving scenarios
//! without real VMs.

mod config;
pub mod fakes;
mod runner;

pub use config::*;
pub use runner::{build_env, check_scenario, execute, load_scenario, run_scenario, TestResult};
