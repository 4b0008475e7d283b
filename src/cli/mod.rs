//! CLI command handling
//!
//! Dispatches CLI commands to the scenario runner and formats output.

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::scenarios::ScenarioKind;
use crate::testing;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            path,
            verbose,
            log_file: _,
            config,
        } => {
            let config = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load()?,
            };

            let result = testing::run_scenario(&path, &config, verbose).await?;
            if result.passed() {
                Ok(())
            } else {
                Err(Error::TestFail(format!(
                    "Scenario '{}' finished with {}",
                    result.name,
                    result.verdict.label()
                )))
            }
        }

        Commands::Check { path } => {
            let scenario = testing::check_scenario(&path)?;
            println!(
                "{} {} ({}, {} parameters)",
                "✓".green(),
                scenario.name,
                scenario.kind,
                scenario.params.len()
            );
            Ok(())
        }

        Commands::List => {
            for kind in ScenarioKind::ALL {
                println!("{:<22} {}", kind.name().bold(), kind.description());
            }
            Ok(())
        }
    }
}
