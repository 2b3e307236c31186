//! Pipeline command handlers
//!
//! Handles all pipeline-related CLI commands including creation,
//! local validation, listing, viewing and deletion.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use conveyor_core::domain::pipeline::PipelineDefinition;
use conveyor_core::dto::pipeline::{CreatePipeline, PipelineSummary};
use std::path::Path;

use crate::config::Config;
use conveyor_client::OrchestratorClient;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Register a pipeline from a Lua script or JSON definition
    Create {
        /// Path to a `.lua` script or `.json` definition
        file: String,
    },
    /// Parse and validate a pipeline file without contacting the orchestrator
    Validate {
        /// Path to a `.lua` script or `.json` definition
        file: String,
    },
    /// List all pipelines
    List,
    /// Get pipeline details
    Get {
        /// Pipeline name
        name: String,
    },
    /// Delete a pipeline
    Delete {
        /// Pipeline name
        name: String,
    },
}

/// Source format of a pipeline file
#[derive(Debug, PartialEq, Eq)]
enum SourceKind {
    Lua,
    Json,
}

impl SourceKind {
    fn from_path(path: &str) -> Result<Self> {
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("lua") => Ok(SourceKind::Lua),
            Some("json") => Ok(SourceKind::Json),
            _ => anyhow::bail!("Unsupported pipeline file '{}': expected .lua or .json", path),
        }
    }
}

/// Handle pipeline commands
///
/// Routes pipeline subcommands to their respective handlers.
pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<i32> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        PipelineCommands::Create { file } => create_pipeline(&client, &file).await?,
        PipelineCommands::Validate { file } => validate_pipeline(&file)?,
        PipelineCommands::List => list_pipelines(&client).await?,
        PipelineCommands::Get { name } => get_pipeline(&client, &name).await?,
        PipelineCommands::Delete { name } => delete_pipeline(&client, &name).await?,
    }

    Ok(0)
}

/// Read a pipeline file and build the creation request
fn read_request(path: &str) -> Result<CreatePipeline> {
    let kind = SourceKind::from_path(path)?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path))?;

    match kind {
        SourceKind::Lua => Ok(CreatePipeline::from_script(content)),
        SourceKind::Json => {
            let definition: PipelineDefinition = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse pipeline definition: {}", path))?;
            Ok(CreatePipeline::from_definition(definition))
        }
    }
}

/// Register a pipeline with the orchestrator
async fn create_pipeline(client: &OrchestratorClient, path: &str) -> Result<()> {
    let req = read_request(path)?;

    let definition = client.create_pipeline(req).await?;

    println!("{}", "✓ Pipeline registered successfully!".green().bold());
    println!("  Name:       {}", definition.name.bold());
    println!("  Repository: {}", definition.repository.cyan());
    println!(
        "  Stages:     {}",
        definition
            .stages
            .iter()
            .map(|s| s.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
            .dimmed()
    );

    Ok(())
}

/// Validate a pipeline file locally
fn validate_pipeline(path: &str) -> Result<()> {
    let req = read_request(path)?;

    let definition = match (req.script, req.definition) {
        (Some(script), _) => conveyor_lua::parse_pipeline_definition(&script)
            .context("Failed to evaluate pipeline script")?,
        (None, Some(definition)) => definition,
        (None, None) => anyhow::bail!("Pipeline file '{}' is empty", path),
    };

    definition
        .validate()
        .with_context(|| format!("Pipeline '{}' is invalid", definition.name))?;

    println!(
        "{}",
        format!("✓ Pipeline '{}' is valid", definition.name)
            .green()
            .bold()
    );
    print_stages(&definition);

    Ok(())
}

/// List all pipelines
async fn list_pipelines(client: &OrchestratorClient) -> Result<()> {
    let pipelines = client.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in pipelines {
            print_pipeline_summary(&pipeline);
        }
    }

    Ok(())
}

/// Get and display a single pipeline
async fn get_pipeline(client: &OrchestratorClient, name: &str) -> Result<()> {
    let definition = client.get_pipeline(name).await?;

    print_pipeline_details(&definition);

    Ok(())
}

/// Delete a pipeline
async fn delete_pipeline(client: &OrchestratorClient, name: &str) -> Result<()> {
    client.delete_pipeline(name).await?;

    println!(
        "{}",
        format!("✓ Pipeline {} deleted successfully!", name)
            .green()
            .bold()
    );

    Ok(())
}

/// Print a pipeline summary
fn print_pipeline_summary(pipeline: &PipelineSummary) {
    println!("  {} {}", "▸".cyan(), pipeline.name.bold());
    println!("    Repository: {}", pipeline.repository.dimmed());
    println!(
        "    Stages:     {}",
        pipeline.stage_count.to_string().dimmed()
    );
    if let Some(desc) = &pipeline.description {
        println!("    Description: {}", desc.dimmed());
    }
    println!();
}

/// Print detailed pipeline information
fn print_pipeline_details(definition: &PipelineDefinition) {
    println!("{}", "Pipeline Details:".bold());
    println!("  Name:        {}", definition.name.bold());
    println!("  Repository:  {}", definition.repository.cyan());
    if let Some(desc) = &definition.description {
        println!("  Description: {}", desc);
    }
    if !definition.gates.is_empty() {
        let gates: Vec<String> = definition.gates.iter().map(|g| g.to_string()).collect();
        println!("  Gate:        {}", gates.join(", "));
    }
    if let Some(canary) = &definition.canary {
        let steps: Vec<String> = canary.steps.iter().map(|s| format!("{}%", s)).collect();
        println!(
            "  Canary:      {} (max failure rate {:.1}%)",
            steps.join(" → "),
            canary.failure_rate_threshold * 100.0
        );
    }

    print_stages(definition);
}

fn print_stages(definition: &PipelineDefinition) {
    println!("\n{}", "Stages:".bold());
    for stage in &definition.stages {
        let mut line = format!("  {} {} [{}]", "▸".cyan(), stage.id.bold(), stage.capability);
        if !stage.depends_on.is_empty() {
            line.push_str(&format!(" after {}", stage.depends_on.join(", ")));
        }
        if stage.optional {
            line.push_str(&format!(" {}", "(optional)".dimmed()));
        }
        println!("{}", line);
    }
}
