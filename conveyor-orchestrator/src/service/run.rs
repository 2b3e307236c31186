//! Run Service
//!
//! Triggering, inspection and control of pipeline runs.

use conveyor_core::domain::run::{Run, RunEvent};
use conveyor_core::domain::trigger::TriggerNotification;
use conveyor_core::dto::gate::GateOverrideRequest;
use conveyor_core::dto::run::{ListRunsQuery, RunSummary};
use uuid::Uuid;

use crate::engine::Orchestrator;
use crate::engine::error::{EngineError, GateError, TriggerError};
use crate::repository::{Repositories, RepositoryError};

/// Service error type
#[derive(Debug)]
pub enum RunError {
    NotFound(Uuid),
    InvalidState(String),
    RepositoryError(RepositoryError),
    EngineError(EngineError),
}

impl From<RepositoryError> for RunError {
    fn from(err: RepositoryError) -> Self {
        RunError::RepositoryError(err)
    }
}

impl From<EngineError> for RunError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::RunNotFound(id) => RunError::NotFound(id),
            EngineError::InvalidState(msg) => RunError::InvalidState(msg),
            EngineError::Repository(e) => RunError::RepositoryError(e),
            other => RunError::EngineError(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;

/// Admit a run for a change notification
pub async fn trigger_run(
    engine: &Orchestrator,
    notification: &TriggerNotification,
) -> std::result::Result<Uuid, TriggerError> {
    tracing::debug!(
        "Trigger received for {}@{} ({})",
        notification.repository,
        notification.branch,
        notification.change_ref
    );
    engine.ingest(notification).await
}

/// List runs, most recent first
pub async fn list_runs(repos: &Repositories, query: &ListRunsQuery) -> Result<Vec<RunSummary>> {
    let runs = repos.runs.list(query).await?;
    Ok(runs.iter().map(RunSummary::from).collect())
}

/// Get a run by ID
pub async fn get_run(repos: &Repositories, id: Uuid) -> Result<Run> {
    repos.runs.find(id).await?.ok_or(RunError::NotFound(id))
}

/// Get the event log of a run
pub async fn get_run_events(repos: &Repositories, id: Uuid) -> Result<Vec<RunEvent>> {
    // Distinguish an unknown run from one without events
    get_run(repos, id).await?;
    Ok(repos.runs.events(id).await?)
}

/// Cancel a run
pub async fn cancel_run(engine: &Orchestrator, id: Uuid) -> Result<Run> {
    let run = engine.cancel(id).await?;
    tracing::info!("Run {} cancellation accepted", id);
    Ok(run)
}

/// Override a failing gate verdict
pub async fn override_gate(
    engine: &Orchestrator,
    id: Uuid,
    req: GateOverrideRequest,
) -> std::result::Result<Run, GateError> {
    engine.override_gate(id, &req.token, req.reason).await
}
