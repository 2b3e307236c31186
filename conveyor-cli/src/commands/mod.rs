//! Commands module
//!
//! Defines all CLI commands and their handlers. Every handler returns the
//! process exit code; only commands that wait on a run produce non-zero.

mod pipeline;
mod release;
mod run;
mod trigger;

pub use pipeline::PipelineCommands;
pub use release::{ArtifactCommands, EnvironmentCommands, GateCommands};
pub use run::RunCommands;
pub use trigger::TriggerArgs;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send a signed change notification
    Trigger(TriggerArgs),
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Run inspection and control
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Quality gate overrides and audit log
    Gate {
        #[command(subcommand)]
        command: GateCommands,
    },
    /// Artifact registry
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
    /// Environment rollout state
    Env {
        #[command(subcommand)]
        command: EnvironmentCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Returns
/// The exit code the process should terminate with
pub async fn handle_command(command: Commands, config: &Config) -> Result<i32> {
    match command {
        Commands::Trigger(args) => trigger::handle_trigger(args, config).await,
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, config).await,
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Gate { command } => release::handle_gate_command(command, config).await,
        Commands::Artifact { command } => release::handle_artifact_command(command, config).await,
        Commands::Env { command } => release::handle_environment_command(command, config).await,
    }
}
