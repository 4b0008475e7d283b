//! VM test scenarios
//!
//! Fault-injection and guest-setup scenarios for QEMU virtual machines,
//! built on small collaborator traits (`HostExecutor`, `Vm`,
//! `GuestSession`, `Monitor`, `Clock`) so every scenario can also be driven
//! by the recording fakes in `testing::fakes`.

pub mod cli;
pub mod commands;
pub mod common;
pub mod guest;
pub mod host;
pub mod outcome;
pub mod params;
pub mod scenarios;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use outcome::{Outcome, Verdict};
pub use params::Params;
