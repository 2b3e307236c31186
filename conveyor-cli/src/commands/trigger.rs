//! Trigger command handler
//!
//! Signs a change notification with the shared secret and submits it.

use anyhow::Result;
use clap::Args;
use colored::*;
use conveyor_core::domain::trigger::TriggerNotification;

use crate::commands::run::wait_for_run;
use crate::config::Config;
use conveyor_client::OrchestratorClient;

/// Arguments of `conveyor trigger`
#[derive(Args)]
pub struct TriggerArgs {
    /// Repository identifier the pipeline is bound to
    #[arg(short, long)]
    repository: String,

    /// Branch the change landed on
    #[arg(short, long, default_value = "main")]
    branch: String,

    /// Commit or change reference
    #[arg(short = 'c', long = "ref")]
    change_ref: String,

    /// Shared secret used to sign the notification
    #[arg(long, env = "CONVEYOR_TRIGGER_SECRET", hide_env_values = true)]
    secret: String,

    /// Wait for the run to finish and exit with its outcome code
    #[arg(short, long)]
    wait: bool,
}

/// Handle `conveyor trigger`
pub async fn handle_trigger(args: TriggerArgs, config: &Config) -> Result<i32> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    let notification = TriggerNotification::signed(
        args.repository,
        args.branch,
        args.change_ref,
        &args.secret,
    );

    let accepted = client.trigger(&notification).await?;

    if accepted.duplicate {
        println!(
            "{}",
            "Duplicate notification, an existing run covers this change".yellow()
        );
    } else {
        println!("{}", "✓ Run admitted".green().bold());
    }
    println!("  Run ID: {}", accepted.run_id.to_string().cyan());

    if args.wait {
        return wait_for_run(&client, accepted.run_id).await;
    }

    Ok(0)
}
