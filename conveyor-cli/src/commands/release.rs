//! Release command handlers
//!
//! Artifacts, environments, gate overrides and the gate audit log.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conveyor_core::domain::artifact::{Artifact, ArtifactState};
use conveyor_core::domain::deployment::{Deployment, RolloutState};
use conveyor_core::domain::gate::GateBypass;
use conveyor_core::dto::gate::GateOverrideRequest;
use uuid::Uuid;

use crate::config::Config;
use conveyor_client::OrchestratorClient;

/// Artifact subcommands
#[derive(Subcommand)]
pub enum ArtifactCommands {
    /// List artifacts
    List {
        /// Only artifacts of this pipeline
        #[arg(short, long)]
        pipeline: Option<String>,
    },
    /// Get a single artifact version
    Get { pipeline: String, version: String },
}

/// Environment subcommands
#[derive(Subcommand)]
pub enum EnvironmentCommands {
    /// List environments
    List,
    /// Show rollout state and health history of an environment
    Get { name: String },
    /// Force a rollback to the previous version
    Rollback {
        name: String,

        /// Reason recorded with the rollback
        #[arg(short, long)]
        reason: Option<String>,
    },
}

/// Gate subcommands
#[derive(Subcommand)]
pub enum GateCommands {
    /// Override a failing quality gate
    Override {
        /// Run ID
        run_id: Uuid,

        /// Bypass token issued to the operator
        #[arg(long, env = "CONVEYOR_GATE_TOKEN", hide_env_values = true)]
        token: String,

        /// Reason recorded in the audit log
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Show the gate override audit log
    Audit {
        /// Only entries for this run
        #[arg(long)]
        run_id: Option<Uuid>,
    },
}

/// Handle artifact commands
pub async fn handle_artifact_command(command: ArtifactCommands, config: &Config) -> Result<i32> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        ArtifactCommands::List { pipeline } => {
            let artifacts = client.list_artifacts(pipeline.as_deref()).await?;
            if artifacts.is_empty() {
                println!("{}", "No artifacts found.".yellow());
            } else {
                println!(
                    "{}",
                    format!("Found {} artifact(s):", artifacts.len()).bold()
                );
                println!();
                for artifact in artifacts {
                    print_artifact(&artifact);
                }
            }
        }
        ArtifactCommands::Get { pipeline, version } => {
            let artifact = client.get_artifact(&pipeline, &version).await?;
            print_artifact(&artifact);
        }
    }

    Ok(0)
}

/// Handle environment commands
pub async fn handle_environment_command(
    command: EnvironmentCommands,
    config: &Config,
) -> Result<i32> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        EnvironmentCommands::List => {
            let environments = client.list_environments().await?;
            if environments.is_empty() {
                println!("{}", "No environments deployed yet.".yellow());
            }
            for deployment in environments {
                print_environment_summary(&deployment);
            }
        }
        EnvironmentCommands::Get { name } => {
            let deployment = client.get_environment(&name).await?;
            print_environment_details(&deployment);
        }
        EnvironmentCommands::Rollback { name, reason } => {
            let deployment = client.rollback_environment(&name, reason).await?;
            println!(
                "{}",
                format!("✓ Environment {} rolled back", name).green().bold()
            );
            print_environment_summary(&deployment);
        }
    }

    Ok(0)
}

/// Handle gate commands
pub async fn handle_gate_command(command: GateCommands, config: &Config) -> Result<i32> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        GateCommands::Override {
            run_id,
            token,
            reason,
        } => {
            let run = client
                .override_gate(run_id, &GateOverrideRequest { token, reason })
                .await?;
            println!("{}", "✓ Quality gate overridden".green().bold());
            println!("  Run ID: {}", run.id.to_string().cyan());
            println!("  Status: {}", run.status);
        }
        GateCommands::Audit { run_id } => {
            let entries = client.gate_audit(run_id).await?;
            if entries.is_empty() {
                println!("{}", "No gate overrides recorded.".yellow());
            }
            for entry in entries {
                print_bypass(&entry);
            }
        }
    }

    Ok(0)
}

fn colorize_artifact_state(state: ArtifactState) -> ColoredString {
    let s = state.to_string();
    match state {
        ArtifactState::Released => s.green(),
        ArtifactState::Staged => s.yellow(),
        ArtifactState::RolledBack => s.red(),
        ArtifactState::Deprecated => s.dimmed(),
    }
}

fn colorize_rollout_state(state: RolloutState) -> ColoredString {
    let s = state.to_string();
    match state {
        RolloutState::Healthy => s.green(),
        RolloutState::RolloutInProgress => s.yellow(),
        RolloutState::RollingBack => s.red(),
        RolloutState::Idle => s.normal(),
    }
}

fn print_artifact(artifact: &Artifact) {
    println!(
        "  {} {}@{} {}",
        "▸".cyan(),
        artifact.pipeline.bold(),
        artifact.version.bold(),
        colorize_artifact_state(artifact.state)
    );
    println!("    Content: {}", artifact.content_ref.dimmed());
    println!("    Run:     {}", artifact.run_id.to_string().dimmed());
    println!(
        "    Registered: {}",
        artifact
            .registered_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(released) = artifact.released_at {
        println!(
            "    Released:   {}",
            released.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    println!();
}

fn print_environment_summary(deployment: &Deployment) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        deployment.environment.bold(),
        colorize_rollout_state(deployment.state)
    );
    println!(
        "    Current:  {}",
        deployment.current_version.as_deref().unwrap_or("-").cyan()
    );
    println!(
        "    Previous: {}",
        deployment.previous_version.as_deref().unwrap_or("-").dimmed()
    );
    if let Some(rollout) = &deployment.in_flight {
        println!(
            "    Rolling out {} at {}%",
            rollout.version.yellow(),
            rollout.traffic_percent
        );
    }
    println!();
}

fn print_environment_details(deployment: &Deployment) {
    print_environment_summary(deployment);

    if deployment.health_history.is_empty() {
        return;
    }

    println!("{}", "Health history:".bold());
    for sample in &deployment.health_history {
        let probe = if sample.probe_success {
            "ok".green()
        } else {
            "failed".red()
        };
        println!(
            "  {} traffic {:>3}% error rate {:.2}% probe {}",
            sample.at.format("%H:%M:%S").to_string().dimmed(),
            sample.traffic_percent,
            sample.error_rate * 100.0,
            probe
        );
    }
}

fn print_bypass(entry: &GateBypass) {
    println!(
        "  {} run {} by {}",
        "▸".cyan(),
        entry.run_id.to_string().bold(),
        entry.actor.cyan()
    );
    println!(
        "    At:     {}",
        entry.at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
    );
    println!("    Waived: {}", entry.waived_conditions.join(", "));
    if let Some(reason) = &entry.reason {
        println!("    Reason: {}", reason.dimmed());
    }
    println!();
}
