//! Stage adapters
//!
//! Every external tool (compiler, analyzer, packager) is reached through the
//! [`StageAdapter`] contract: run, report success or failure, and hand back
//! an output handle. Adapters are selected by name from the
//! [`AdapterRegistry`].

use async_trait::async_trait;
use conveyor_core::domain::artifact::ArtifactHandle;
use conveyor_core::domain::gate::MetricsPayload;
use conveyor_core::domain::pipeline::StageDefinition;
use conveyor_core::domain::run::TriggerContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::engine::error::StageError;

/// Adapter used for stages that name no adapter and carry a command
pub const COMMAND_ADAPTER: &str = "command";
/// Adapter used for stages that name no adapter and carry no command
pub const NOOP_ADAPTER: &str = "noop";

/// Everything an adapter needs to know about the attempt it runs
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub pipeline: String,
    pub stage: StageDefinition,
    pub trigger: TriggerContext,
    pub attempt: u32,
}

/// Result reported by a successful adapter run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput {
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub metrics: Option<MetricsPayload>,
    #[serde(default)]
    pub artifact: Option<ArtifactHandle>,
}

#[async_trait]
pub trait StageAdapter: Send + Sync {
    /// Runs one attempt. Implementations must return promptly once `cancel`
    /// fires.
    async fn run(
        &self,
        ctx: &StageContext,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError>;
}

/// Named adapters available to stages
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn StageAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registers (or replaces) an adapter under `name`
    pub fn register(mut self, name: impl Into<String>, adapter: Arc<dyn StageAdapter>) -> Self {
        self.adapters.insert(name.into(), adapter);
        self
    }

    /// Adapter for a stage: its explicit adapter name, else the command
    /// adapter when a command is set, else the no-op adapter
    pub fn resolve(&self, stage: &StageDefinition) -> Result<Arc<dyn StageAdapter>, StageError> {
        let name = match (&stage.adapter, &stage.command) {
            (Some(name), _) => name.as_str(),
            (None, Some(_)) => COMMAND_ADAPTER,
            (None, None) => NOOP_ADAPTER,
        };

        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| StageError::Execution(format!("no adapter named '{}'", name)))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
            .register(COMMAND_ADAPTER, Arc::new(CommandAdapter::default()))
            .register(NOOP_ADAPTER, Arc::new(NoopAdapter))
    }
}

/// Runs the stage command through `sh -c`.
///
/// Run metadata is exported as `CONVEYOR_*` environment variables. If the
/// last non-empty line of stdout is a JSON [`StageOutput`] it becomes the
/// stage output (metrics for analysis stages, the artifact handle for
/// package stages).
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    shell: String,
}

impl Default for CommandAdapter {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

#[async_trait]
impl StageAdapter for CommandAdapter {
    async fn run(
        &self,
        ctx: &StageContext,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        let command = ctx.stage.command.as_deref().ok_or_else(|| {
            StageError::Execution(format!("stage '{}' has no command", ctx.stage.id))
        })?;

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .env("CONVEYOR_RUN_ID", ctx.run_id.to_string())
            .env("CONVEYOR_PIPELINE", &ctx.pipeline)
            .env("CONVEYOR_STAGE", &ctx.stage.id)
            .env("CONVEYOR_CAPABILITY", ctx.stage.capability.to_string())
            .env("CONVEYOR_ATTEMPT", ctx.attempt.to_string())
            .env("CONVEYOR_REPOSITORY", &ctx.trigger.repository)
            .env("CONVEYOR_BRANCH", &ctx.trigger.branch)
            .env("CONVEYOR_CHANGE_REF", &ctx.trigger.change_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::Execution(format!("failed to spawn command: {}", e)))?;

        // Dropping the wait future on cancellation kills the child
        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| StageError::Execution(format!("failed to wait for command: {}", e)))?,
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            "Stage {} attempt {} exited with {:?}, stdout_len={}, stderr_len={}",
            ctx.stage.id,
            ctx.attempt,
            output.status.code(),
            stdout.len(),
            stderr.len()
        );

        if !output.status.success() {
            return Err(StageError::Execution(format!(
                "command exited with {}: {}",
                output
                    .status
                    .code()
                    .map_or("signal".to_string(), |c| c.to_string()),
                stderr.trim()
            )));
        }

        Ok(parse_output(&stdout))
    }
}

/// Interprets the last non-empty stdout line as a [`StageOutput`]
fn parse_output(stdout: &str) -> StageOutput {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str(line.trim()).ok())
        .unwrap_or_default()
}

/// Succeeds immediately without producing output
pub struct NoopAdapter;

#[async_trait]
impl StageAdapter for NoopAdapter {
    async fn run(
        &self,
        _ctx: &StageContext,
        _cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        Ok(StageOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::pipeline::Capability;

    fn context(stage: StageDefinition) -> StageContext {
        StageContext {
            run_id: Uuid::new_v4(),
            pipeline: "p".to_string(),
            stage,
            trigger: TriggerContext {
                repository: "acme/p".to_string(),
                branch: "main".to_string(),
                change_ref: "abc".to_string(),
            },
            attempt: 1,
        }
    }

    fn command_stage(command: &str) -> StageDefinition {
        StageDefinition {
            command: Some(command.to_string()),
            ..StageDefinition::new("s", Capability::Custom)
        }
    }

    #[test]
    fn test_resolve_by_name_and_fallbacks() {
        let registry = AdapterRegistry::default();

        assert!(registry.resolve(&StageDefinition::new("a", Capability::Build)).is_ok());
        assert!(registry.resolve(&command_stage("true")).is_ok());

        let unknown = StageDefinition {
            adapter: Some("gradle".to_string()),
            ..StageDefinition::new("a", Capability::Build)
        };
        assert!(matches!(
            registry.resolve(&unknown),
            Err(StageError::Execution(_))
        ));
    }

    #[test]
    fn test_parse_output_uses_last_line() {
        let out = parse_output("building...\n{\"metrics\": {\"bugs\": 2}}\n\n");
        assert_eq!(out.metrics.unwrap()["bugs"], 2.0);

        assert_eq!(parse_output("plain text"), StageOutput::default());
    }

    #[tokio::test]
    async fn test_command_adapter_success_and_output() {
        let stage = command_stage(
            r#"echo "packaging $CONVEYOR_STAGE"; echo '{"artifact": {"version": "1.0.0", "contentRef": "sha256:abc"}}'"#,
        );
        let output = CommandAdapter::default()
            .run(&context(stage), CancellationToken::new())
            .await
            .unwrap();

        let artifact = output.artifact.unwrap();
        assert_eq!(artifact.version, "1.0.0");
        assert_eq!(artifact.content_ref, "sha256:abc");
    }

    #[tokio::test]
    async fn test_command_adapter_failure() {
        let result = CommandAdapter::default()
            .run(&context(command_stage("echo nope >&2; exit 3")), CancellationToken::new())
            .await;

        match result {
            Err(StageError::Execution(msg)) => assert!(msg.contains("nope")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_command_adapter_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = CommandAdapter::default()
            .run(&context(command_stage("sleep 30")), cancel)
            .await;
        assert!(matches!(result, Err(StageError::Cancelled)));
    }
}
