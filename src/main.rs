//! VM test scenario runner
//!
//! Runs fault-injection and guest-setup scenarios against QEMU guests
//! described by a YAML scenario file.

use clap::Parser;
use commands::Commands;
use vt_scenarios::{cli, commands, common::logging};

#[derive(Parser)]
#[command(name = "vt-scenario", about = "Run VM test scenarios")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { path, log_file, .. } => {
            let scenario = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "scenario".to_string());
            if let Some(log_path) = logging::init_run(log_file.as_deref(), &scenario) {
                tracing::info!("Logging to {}", log_path.display());
            }
        }
        _ => logging::init_cli(),
    }

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
