//! Run command handlers
//!
//! Listing, inspecting, watching and cancelling runs.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conveyor_core::domain::gate::Verdict;
use conveyor_core::domain::run::{
    Run, RunEvent, RunEventKind, RunOutcome, RunStatus, StageResult, StageStatus,
};
use conveyor_core::dto::run::{ListRunsQuery, RunSummary};
use uuid::Uuid;

use crate::config::{Config, POLL_INTERVAL};
use conveyor_client::OrchestratorClient;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List runs
    List {
        /// Only runs of this pipeline
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Only runs in this status (running, succeeded, failed, cancelled)
        #[arg(short, long, value_parser = parse_status)]
        status: Option<RunStatus>,
    },
    /// Get run details
    Get {
        /// Run ID
        id: Uuid,
    },
    /// Show the event log of a run
    Events {
        /// Run ID
        id: Uuid,
    },
    /// Wait for a run to finish and exit with its outcome code
    Watch {
        /// Run ID
        id: Uuid,
    },
    /// Cancel a running run
    Cancel {
        /// Run ID
        id: Uuid,
    },
}

fn parse_status(s: &str) -> Result<RunStatus> {
    match s.to_ascii_lowercase().as_str() {
        "running" => Ok(RunStatus::Running),
        "succeeded" => Ok(RunStatus::Succeeded),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => anyhow::bail!("unknown run status `{}`", other),
    }
}

/// Handle run commands
pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<i32> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        RunCommands::List { pipeline, status } => {
            list_runs(&client, ListRunsQuery { pipeline, status }).await?
        }
        RunCommands::Get { id } => get_run(&client, id).await?,
        RunCommands::Events { id } => get_run_events(&client, id).await?,
        RunCommands::Watch { id } => return wait_for_run(&client, id).await,
        RunCommands::Cancel { id } => cancel_run(&client, id).await?,
    }

    Ok(0)
}

/// Poll a run until it reaches a terminal status
///
/// Stage transitions are printed as they are observed.
///
/// # Returns
/// The exit code of the run's outcome
pub async fn wait_for_run(client: &OrchestratorClient, id: Uuid) -> Result<i32> {
    println!("{}", format!("Waiting for run {}...", id).dimmed());

    let mut seen: Vec<(String, StageStatus)> = Vec::new();

    loop {
        let run = client.get_run(id).await?;

        for (stage, result) in &run.stages {
            let entry = (stage.clone(), result.status);
            if result.status != StageStatus::Pending && !seen.contains(&entry) {
                println!("  {} {}", stage.bold(), colorize_stage(result));
                seen.push(entry);
            }
        }

        if let Some(outcome) = run.outcome() {
            println!();
            print_outcome(&run, outcome);
            return Ok(outcome.exit_code());
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// List runs
async fn list_runs(client: &OrchestratorClient, query: ListRunsQuery) -> Result<()> {
    let runs = client.list_runs(&query).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in runs {
            print_run_summary(&run);
        }
    }

    Ok(())
}

/// Get and display a single run
async fn get_run(client: &OrchestratorClient, id: Uuid) -> Result<()> {
    let run = client.get_run(id).await?;

    print_run_details(&run);

    Ok(())
}

/// Display the event log of a run
async fn get_run_events(client: &OrchestratorClient, id: Uuid) -> Result<()> {
    let events = client.get_run_events(id).await?;

    if events.is_empty() {
        println!("{}", "No events recorded.".yellow());
        return Ok(());
    }

    println!("{}", format!("Events for run {}:", id).bold());
    for event in events {
        print_event(&event);
    }

    Ok(())
}

/// Cancel a run
async fn cancel_run(client: &OrchestratorClient, id: Uuid) -> Result<()> {
    let run = client.cancel_run(id).await?;

    println!("{}", "✓ Cancellation requested".green().bold());
    println!("  Run ID: {}", run.id.to_string().cyan());
    println!("  Status: {}", colorize_status(run.status));

    Ok(())
}

fn colorize_status(status: RunStatus) -> ColoredString {
    let s = status.to_string();
    match status {
        RunStatus::Running => s.yellow(),
        RunStatus::Succeeded => s.green(),
        RunStatus::Failed => s.red(),
        RunStatus::Cancelled => s.dimmed(),
    }
}

fn colorize_verdict(verdict: Verdict) -> ColoredString {
    let s = verdict.to_string();
    match verdict {
        Verdict::Pass => s.green(),
        Verdict::Warn => s.yellow(),
        Verdict::Fail => s.red(),
    }
}

fn colorize_stage(result: &StageResult) -> ColoredString {
    let s = match (&result.failure, result.attempts) {
        (Some(failure), _) => format!("{} ({:?}: {})", result.status, failure.kind, failure.message),
        (None, n) if n > 1 => format!("{} (attempt {})", result.status, n),
        _ => result.status.to_string(),
    };
    match result.status {
        StageStatus::Succeeded => s.green(),
        StageStatus::Failed => s.red(),
        StageStatus::Running | StageStatus::Retrying => s.yellow(),
        StageStatus::Pending | StageStatus::Skipped => s.dimmed(),
    }
}

fn print_outcome(run: &Run, outcome: RunOutcome) {
    let line = format!(
        "Run {} finished: {:?} (exit code {})",
        run.id,
        outcome,
        outcome.exit_code()
    );
    if outcome == RunOutcome::Succeeded {
        println!("{}", line.green().bold());
    } else {
        println!("{}", line.red().bold());
    }
}

/// Print a run summary
fn print_run_summary(run: &RunSummary) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        run.id.to_string().bold(),
        colorize_status(run.status)
    );
    println!("    Pipeline:  {}", run.pipeline.dimmed());
    println!(
        "    Change:    {}",
        format!("{}@{} {}", run.repository, run.branch, run.change_ref).dimmed()
    );
    if let Some(verdict) = run.verdict {
        println!("    Gate:      {}", colorize_verdict(verdict));
    }
    println!(
        "    Requested: {}",
        run.requested_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print detailed run information
fn print_run_details(run: &Run) {
    println!("{}", "Run Details:".bold());
    println!("  ID:        {}", run.id.to_string().cyan());
    println!("  Pipeline:  {}", run.pipeline.bold());
    println!(
        "  Change:    {}@{} {}",
        run.trigger.repository, run.trigger.branch, run.trigger.change_ref
    );
    println!("  Status:    {}", colorize_status(run.status));
    if let Some(outcome) = run.outcome() {
        println!("  Outcome:   {:?} (exit code {})", outcome, outcome.exit_code());
    }
    println!(
        "  Requested: {}",
        run.requested_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(version) = &run.artifact_version {
        println!("  Artifact:  {}", version.cyan());
    }

    println!("\n{}", "Stages:".bold());
    for stage in &run.definition.stages {
        if let Some(result) = run.stages.get(&stage.id) {
            println!("  {} {} {}", "▸".cyan(), stage.id.bold(), colorize_stage(result));
        }
    }

    if let Some(gate) = &run.gate {
        println!("\n{} {}", "Quality Gate:".bold(), colorize_verdict(gate.verdict));
        for outcome in &gate.conditions {
            let observed = outcome
                .observed
                .map(|v| v.to_string())
                .unwrap_or_else(|| "missing".to_string());
            println!(
                "  {} {} (observed {})",
                colorize_verdict(outcome.verdict),
                outcome.condition,
                observed
            );
        }
        if let Some(bypass) = &gate.bypass {
            println!(
                "  {} by {} at {}",
                "Overridden".yellow(),
                bypass.actor.bold(),
                bypass.at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
}

fn print_event(event: &RunEvent) {
    let at = event.at.format("%H:%M:%S").to_string();
    let description = match &event.kind {
        RunEventKind::Created => "run created".to_string(),
        RunEventKind::StageChanged {
            stage,
            status,
            attempt,
        } => format!("stage {} → {} (attempt {})", stage, status, attempt),
        RunEventKind::GateEvaluated { verdict } => format!("gate evaluated: {}", verdict),
        RunEventKind::GateOverridden { actor } => format!("gate overridden by {}", actor),
        RunEventKind::ArtifactRegistered { version } => {
            format!("artifact {} registered", version)
        }
        RunEventKind::StatusChanged { status } => format!("run {}", status),
        RunEventKind::Resumed => "run resumed after restart".to_string(),
    };
    println!(
        "  {} {} {}",
        format!("#{:<3}", event.sequence).dimmed(),
        at.dimmed(),
        description
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("failed").unwrap(), RunStatus::Failed);
        assert_eq!(parse_status("Running").unwrap(), RunStatus::Running);
        assert!(parse_status("done").is_err());
    }
}
