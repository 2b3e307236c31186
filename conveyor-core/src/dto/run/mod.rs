//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::gate::Verdict;
use crate::domain::run::{Run, RunOutcome, RunStatus};

/// Condensed run listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline: String,
    pub repository: String,
    pub branch: String,
    pub change_ref: String,
    pub status: RunStatus,
    pub outcome: Option<RunOutcome>,
    pub verdict: Option<Verdict>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            pipeline: run.pipeline.clone(),
            repository: run.trigger.repository.clone(),
            branch: run.trigger.branch.clone(),
            change_ref: run.trigger.change_ref.clone(),
            status: run.status,
            outcome: run.outcome(),
            verdict: run.gate.as_ref().map(|g| g.verdict),
            requested_at: run.requested_at,
            completed_at: run.completed_at,
        }
    }
}

/// Filters for run listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub status: Option<RunStatus>,
}
