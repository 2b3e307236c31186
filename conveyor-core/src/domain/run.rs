//! Run domain types
//!
//! A run is one execution of a pipeline definition. The run carries a snapshot
//! of the definition it was started from, the trigger context, and one
//! [`StageResult`] per stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::gate::{GateEvaluation, MetricsPayload, Verdict};
use crate::domain::pipeline::PipelineDefinition;

/// Pipeline run record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub pipeline: String,
    pub definition: PipelineDefinition,
    pub trigger: TriggerContext,
    pub status: RunStatus,
    pub stages: BTreeMap<String, StageResult>,
    #[serde(default)]
    pub metrics: Option<MetricsPayload>,
    #[serde(default)]
    pub gate: Option<GateEvaluation>,
    /// Version of the artifact produced by this run's package stage
    #[serde(default)]
    pub artifact_version: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The change that caused a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    pub repository: String,
    pub branch: String,
    pub change_ref: String,
}

/// Run execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Stage execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Retrying,
}

impl StageStatus {
    /// Whether the stage can no longer change without an operator action
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    /// Whether the stage currently occupies an executor slot
    pub fn is_active(&self) -> bool {
        matches!(self, StageStatus::Running | StageStatus::Retrying)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Retrying => "retrying",
        };
        write!(f, "{}", s)
    }
}

/// Result of one stage within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub status: StageStatus,
    pub attempts: u32,
    /// Opaque handle to logs or metrics produced by the adapter
    #[serde(default)]
    pub output_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
}

impl StageResult {
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            attempts: 0,
            output_ref: None,
            started_at: None,
            completed_at: None,
            failure: None,
            skip_reason: None,
        }
    }
}

/// Classified reason for a failed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Failure classification used for retry decisions and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    Timeout,
    QualityGate,
    DependencyUnmet,
    ArtifactPublish,
    RolloutRejected,
    HealthCheck,
    RollbackFailed,
    Cancelled,
}

impl FailureKind {
    /// Whether the stage retry policy applies to this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Execution | FailureKind::Timeout | FailureKind::ArtifactPublish
        )
    }
}

/// Why a stage was skipped without running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "stage")]
pub enum SkipReason {
    /// A (transitive) dependency did not succeed
    UpstreamFailed(String),
    /// The quality gate verdict is `fail` and was not overridden
    GateBlocked,
    /// The run was cancelled before the stage started
    Cancelled,
}

/// Classified outcome of a terminal run, mapped onto CLI exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    StageFailed,
    QualityGateFailed,
    TimedOut,
    RolledBack,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::StageFailed => 1,
            RunOutcome::QualityGateFailed => 2,
            RunOutcome::TimedOut => 3,
            RunOutcome::RolledBack => 4,
        }
    }
}

impl Run {
    /// Creates a new running run with every stage pending
    pub fn new(definition: PipelineDefinition, trigger: TriggerContext) -> Self {
        let now = Utc::now();
        let stages = definition
            .stages
            .iter()
            .map(|s| (s.id.clone(), StageResult::pending()))
            .collect();

        Self {
            id: Uuid::new_v4(),
            pipeline: definition.name.clone(),
            definition,
            trigger,
            status: RunStatus::Running,
            stages,
            metrics: None,
            gate: None,
            artifact_version: None,
            requested_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether no stage is pending or active
    pub fn all_settled(&self) -> bool {
        self.stages.values().all(|r| r.status.is_settled())
    }

    /// Whether every mandatory stage succeeded
    pub fn mandatory_stages_succeeded(&self) -> bool {
        self.definition
            .stages
            .iter()
            .filter(|s| !s.optional)
            .all(|s| {
                self.stages
                    .get(&s.id)
                    .is_some_and(|r| r.status == StageStatus::Succeeded)
            })
    }

    /// Terminal status implied by the stage results
    pub fn settled_status(&self) -> RunStatus {
        if self.mandatory_stages_succeeded() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    /// Whether the gate verdict (including any override) permits gated work
    pub fn gate_allows_promotion(&self) -> bool {
        match &self.gate {
            Some(evaluation) => evaluation.is_acceptable(),
            // Without an evaluation only an ungated pipeline may promote
            None => self.definition.gates.is_empty(),
        }
    }

    /// Whether the run failed only because the quality gate blocked it
    pub fn failed_by_gate(&self) -> bool {
        self.status == RunStatus::Failed
            && self
                .gate
                .as_ref()
                .is_some_and(|g| g.verdict == Verdict::Fail && g.bypass.is_none())
            && self.stages.values().all(|r| match r.status {
                StageStatus::Failed => r
                    .failure
                    .as_ref()
                    .is_some_and(|f| f.kind == FailureKind::QualityGate),
                StageStatus::Skipped => !matches!(r.skip_reason, Some(SkipReason::Cancelled)),
                _ => true,
            })
    }

    /// Classifies a terminal run for exit codes. Running runs report `None`.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.status {
            RunStatus::Running => None,
            RunStatus::Succeeded => Some(RunOutcome::Succeeded),
            RunStatus::Cancelled => Some(RunOutcome::StageFailed),
            RunStatus::Failed => {
                let kinds: Vec<FailureKind> = self
                    .stages
                    .values()
                    .filter_map(|r| r.failure.as_ref().map(|f| f.kind))
                    .collect();

                let outcome = if kinds
                    .iter()
                    .any(|k| matches!(k, FailureKind::HealthCheck | FailureKind::RollbackFailed))
                {
                    RunOutcome::RolledBack
                } else if kinds.contains(&FailureKind::Timeout) {
                    RunOutcome::TimedOut
                } else if kinds.contains(&FailureKind::QualityGate)
                    || self.stages.values().any(|r| r.skip_reason == Some(SkipReason::GateBlocked))
                {
                    RunOutcome::QualityGateFailed
                } else {
                    RunOutcome::StageFailed
                };
                Some(outcome)
            }
        }
    }
}

/// Append-only record of a run state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: Uuid,
    pub sequence: i64,
    pub at: DateTime<Utc>,
    pub kind: RunEventKind,
}

/// Kind of run state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RunEventKind {
    Created,
    StageChanged {
        stage: String,
        status: StageStatus,
        attempt: u32,
    },
    GateEvaluated {
        verdict: Verdict,
    },
    GateOverridden {
        actor: String,
    },
    ArtifactRegistered {
        version: String,
    },
    StatusChanged {
        status: RunStatus,
    },
    Resumed,
}
