//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::gate::GateCondition;
use crate::domain::graph::StageGraph;

/// Default stage timeout when a definition does not declare one
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

/// Pipeline definition
///
/// Static description of a stage DAG bound to a source repository.
/// A run keeps its own snapshot, so edits never affect runs in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub name: String,
    pub repository: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub gates: Vec<GateCondition>,
    #[serde(default)]
    pub canary: Option<CanaryPolicy>,
}

/// A single unit of pipeline work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub id: String,
    pub capability: Capability,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Optional stages may fail without failing the run
    #[serde(default)]
    pub optional: bool,
    /// Name of the adapter that executes this stage. Falls back to the
    /// default adapter registered for the capability.
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    /// Target environment, required for deploy stages
    #[serde(default)]
    pub environment: Option<String>,
}

impl StageDefinition {
    /// Creates a mandatory stage with default retry and timeout policy
    pub fn new(id: impl Into<String>, capability: Capability) -> Self {
        Self {
            id: id.into(),
            capability,
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            optional: false,
            adapter: None,
            command: None,
            environment: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_base_ms: u64) -> Self {
        self.retry = RetryPolicy {
            max_attempts,
            backoff_base_ms,
        };
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Whether a failing quality gate blocks this stage.
    ///
    /// An explicit gate stage carries the verdict itself; package and deploy
    /// stages are gate-dependent only when the pipeline has no gate stage.
    pub fn is_gate_dependent(&self, has_gate_stage: bool) -> bool {
        match self.capability {
            Capability::Gate => true,
            Capability::Package | Capability::Deploy => !has_gate_stage,
            _ => false,
        }
    }
}

/// Capability kind of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Build,
    Analyze,
    Gate,
    Package,
    Deploy,
    Custom,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Build => "build",
            Capability::Analyze => "analyze",
            Capability::Gate => "gate",
            Capability::Package => "package",
            Capability::Deploy => "deploy",
            Capability::Custom => "custom",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Capability {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Capability::Build),
            "analyze" => Ok(Capability::Analyze),
            "gate" => Ok(Capability::Gate),
            "package" => Ok(Capability::Package),
            "deploy" => Ok(Capability::Deploy),
            "custom" => Ok(Capability::Custom),
            other => Err(DefinitionError::UnknownCapability(other.to_string())),
        }
    }
}

/// Retry policy applied to a failing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_ms: 1000,
        }
    }
}

/// Progressive rollout policy for deploy stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryPolicy {
    /// Traffic percentages, ascending and ending at 100
    pub steps: Vec<u8>,
    pub observation_window_seconds: u64,
    pub poll_interval_seconds: u64,
    /// Maximum tolerated failure rate (fraction, e.g. 0.05 = 5%)
    pub failure_rate_threshold: f64,
}

impl Default for CanaryPolicy {
    fn default() -> Self {
        Self {
            steps: vec![10, 50, 100],
            observation_window_seconds: 60,
            poll_interval_seconds: 5,
            failure_rate_threshold: 0.05,
        }
    }
}

impl CanaryPolicy {
    /// A single full-traffic step with the same health thresholds
    pub fn all_at_once(&self) -> Self {
        Self {
            steps: vec![100],
            ..self.clone()
        }
    }
}

/// Errors found while validating a pipeline definition
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("pipeline name cannot be empty")]
    EmptyName,
    #[error("pipeline repository cannot be empty")]
    EmptyRepository,
    #[error("pipeline must have at least one stage")]
    NoStages,
    #[error("duplicate stage id '{0}'")]
    DuplicateStage(String),
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },
    #[error("stage '{0}' depends on itself")]
    SelfDependency(String),
    #[error("stage dependencies form a cycle involving: {0}")]
    Cycle(String),
    #[error("stage '{0}' must allow at least one attempt")]
    ZeroAttempts(String),
    #[error("stage '{0}' must have a timeout greater than 0")]
    ZeroTimeout(String),
    #[error("deploy stage '{0}' must name an environment")]
    MissingEnvironment(String),
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
    #[error("invalid canary policy: {0}")]
    InvalidCanary(String),
    #[error("invalid gate condition: {0}")]
    InvalidGate(String),
    #[error("analysis stage '{analysis}' runs after gate-dependent stage '{stage}'")]
    AnalysisAfterGate { analysis: String, stage: String },
}

impl PipelineDefinition {
    /// Validates structure, dependency references and acyclicity
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.repository.trim().is_empty() {
            return Err(DefinitionError::EmptyRepository);
        }
        if self.stages.is_empty() {
            return Err(DefinitionError::NoStages);
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(DefinitionError::DuplicateStage(stage.id.clone()));
            }
        }

        for stage in &self.stages {
            for dep in &stage.depends_on {
                if dep == &stage.id {
                    return Err(DefinitionError::SelfDependency(stage.id.clone()));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(DefinitionError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            if stage.retry.max_attempts == 0 {
                return Err(DefinitionError::ZeroAttempts(stage.id.clone()));
            }
            if stage.timeout_seconds == 0 {
                return Err(DefinitionError::ZeroTimeout(stage.id.clone()));
            }
            if stage.capability == Capability::Deploy
                && stage.environment.as_deref().is_none_or(|e| e.trim().is_empty())
            {
                return Err(DefinitionError::MissingEnvironment(stage.id.clone()));
            }
        }

        for gate in &self.gates {
            if gate.metric.trim().is_empty() {
                return Err(DefinitionError::InvalidGate(
                    "metric name cannot be empty".to_string(),
                ));
            }
            if !gate.threshold.is_finite() || gate.warn.is_some_and(|w| !w.is_finite()) {
                return Err(DefinitionError::InvalidGate(format!(
                    "thresholds for '{}' must be finite numbers",
                    gate.metric
                )));
            }
        }

        if let Some(canary) = &self.canary {
            validate_canary(canary)?;
        }

        // Cycle detection happens while building the graph
        let graph = StageGraph::build(self)?;

        // Gate-dependent stages wait for every analysis to settle
        let has_gate_stage = self.has_gate_stage();
        for stage in self.stages.iter().filter(|s| s.is_gate_dependent(has_gate_stage)) {
            for dependent in graph.transitive_dependents(&stage.id) {
                if self
                    .stage(&dependent)
                    .is_some_and(|s| s.capability == Capability::Analyze)
                {
                    return Err(DefinitionError::AnalysisAfterGate {
                        analysis: dependent,
                        stage: stage.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Looks up a stage by id
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Whether the pipeline declares an explicit gate stage
    pub fn has_gate_stage(&self) -> bool {
        self.stages.iter().any(|s| s.capability == Capability::Gate)
    }
}

fn validate_canary(canary: &CanaryPolicy) -> Result<(), DefinitionError> {
    if canary.steps.is_empty() {
        return Err(DefinitionError::InvalidCanary(
            "at least one step is required".to_string(),
        ));
    }
    if canary.steps.iter().any(|&s| s == 0 || s > 100) {
        return Err(DefinitionError::InvalidCanary(
            "steps must be between 1 and 100".to_string(),
        ));
    }
    if canary.steps.windows(2).any(|w| w[0] >= w[1]) {
        return Err(DefinitionError::InvalidCanary(
            "steps must be strictly ascending".to_string(),
        ));
    }
    if canary.steps.last() != Some(&100) {
        return Err(DefinitionError::InvalidCanary(
            "the last step must be 100".to_string(),
        ));
    }
    if canary.poll_interval_seconds == 0 {
        return Err(DefinitionError::InvalidCanary(
            "poll interval must be greater than 0".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&canary.failure_rate_threshold) {
        return Err(DefinitionError::InvalidCanary(
            "failure rate threshold must be within [0, 1]".to_string(),
        ));
    }
    Ok(())
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}
