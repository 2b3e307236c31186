//! Engine error types

use conveyor_core::domain::artifact::ArtifactState;
use conveyor_core::domain::pipeline::DefinitionError;
use conveyor_core::domain::run::FailureKind;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::RepositoryError;

/// Failure of a single stage attempt
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage execution failed: {0}")]
    Execution(String),
    #[error("stage timed out after {0:?}")]
    Timeout(Duration),
    #[error("quality gate failed: {0}")]
    QualityGate(String),
    #[error("dependencies not satisfied: {0}")]
    DependencyUnmet(String),
    #[error(transparent)]
    ArtifactPublish(#[from] ArtifactPublishError),
    #[error(transparent)]
    Rollout(#[from] RolloutError),
    #[error("stage cancelled")]
    Cancelled,
}

impl StageError {
    /// Classification recorded on the stage result
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::Execution(_) => FailureKind::Execution,
            StageError::Timeout(_) => FailureKind::Timeout,
            StageError::QualityGate(_) => FailureKind::QualityGate,
            StageError::DependencyUnmet(_) => FailureKind::DependencyUnmet,
            StageError::ArtifactPublish(_) => FailureKind::ArtifactPublish,
            StageError::Rollout(e) => e.kind(),
            StageError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether the stage retry policy applies
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::ArtifactPublish(e) => e.is_transient(),
            other => other.kind().is_retryable(),
        }
    }
}

/// Errors from the artifact registry
#[derive(Debug, Error)]
pub enum ArtifactPublishError {
    #[error("version {version} already registered with different content")]
    VersionConflict { version: String },
    #[error("artifact store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("artifact {version} not found")]
    NotFound { version: String },
    #[error("artifact {version} cannot be promoted from state {state}")]
    NotPromotable { version: String, state: ArtifactState },
    #[error("promotion of {version} refused: {reason}")]
    PromotionRefused { version: String, reason: String },
}

impl ArtifactPublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ArtifactPublishError::StoreUnavailable(_))
    }
}

impl From<RepositoryError> for ArtifactPublishError {
    fn from(err: RepositoryError) -> Self {
        ArtifactPublishError::StoreUnavailable(err.to_string())
    }
}

/// Errors from the rollout controller
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("rollout rejected: environment {environment} {reason}")]
    Rejected { environment: String, reason: String },
    #[error(
        "health check failed in {environment} at {traffic_percent}% traffic: failure rate {failure_rate:.3} exceeds {threshold:.3}"
    )]
    HealthCheckFailed {
        environment: String,
        traffic_percent: u8,
        failure_rate: f64,
        threshold: f64,
    },
    #[error("deploy target failed to apply {version} to {environment}: {message}")]
    ApplyFailed {
        environment: String,
        version: String,
        message: String,
    },
    #[error("rollback of {environment} failed: {message}")]
    RollbackFailed { environment: String, message: String },
    #[error("rollout to {environment} cancelled and rolled back")]
    Cancelled { environment: String },
    #[error("environment {0} not found")]
    EnvironmentNotFound(String),
    #[error("environment {0} has no previous version to roll back to")]
    NothingToRollBack(String),
    #[error("rollout state store failed: {0}")]
    Repository(#[from] RepositoryError),
}

impl RolloutError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RolloutError::Rejected { .. } => FailureKind::RolloutRejected,
            RolloutError::HealthCheckFailed { .. } | RolloutError::ApplyFailed { .. } => {
                FailureKind::HealthCheck
            }
            RolloutError::RollbackFailed { .. } => FailureKind::RollbackFailed,
            RolloutError::Cancelled { .. } => FailureKind::Cancelled,
            RolloutError::EnvironmentNotFound(_)
            | RolloutError::NothingToRollBack(_)
            | RolloutError::Repository(_) => FailureKind::Execution,
        }
    }
}

/// Errors from trigger ingestion
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid trigger: {0}")]
    Validation(String),
    #[error("invalid trigger signature")]
    InvalidSignature,
    #[error("no pipeline registered for repository {0}")]
    UnknownRepository(String),
    #[error("duplicate trigger, run {0} already exists")]
    Duplicate(Uuid),
    #[error("admission queue is full")]
    QueueFull,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Errors from gate overrides
#[derive(Debug, Error)]
pub enum GateError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("unknown bypass token")]
    UnknownToken,
    #[error("run {0} has no failing gate verdict")]
    NotFailing(Uuid),
    #[error("run {0} is still running")]
    RunActive(Uuid),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Errors from run execution and control
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("invalid run state: {0}")]
    InvalidState(String),
    #[error("stored definition is invalid: {0}")]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Rollout(#[from] RolloutError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
