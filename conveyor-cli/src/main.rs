//! Conveyor CLI
//!
//! Command-line interface for interacting with the Conveyor orchestrator.
//! Commands that wait on a run exit with the run's outcome code.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor build and release pipeline CLI", long_about = None)]
struct Cli {
    /// Orchestrator URL
    #[arg(
        long,
        env = "CONVEYOR_ORCHESTRATOR_URL",
        default_value = "http://localhost:8080"
    )]
    orchestrator_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        orchestrator_url: cli.orchestrator_url,
    };

    let code = handle_command(cli.command, &config).await?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
