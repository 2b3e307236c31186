//! Environment Service
//!
//! Inspection and manual rollback of deployment environments.

use conveyor_core::domain::deployment::Deployment;
use conveyor_core::dto::environment::RollbackRequest;

use crate::engine::Orchestrator;
use crate::engine::error::RolloutError;

pub type Result<T> = std::result::Result<T, RolloutError>;

/// List all environments with a rollout record
pub async fn list_environments(engine: &Orchestrator) -> Result<Vec<Deployment>> {
    engine.rollout().list().await
}

/// Get the rollout record of an environment
pub async fn get_environment(engine: &Orchestrator, name: &str) -> Result<Deployment> {
    engine.rollout().get(name).await
}

/// Force a rollback of an environment
pub async fn rollback_environment(
    engine: &Orchestrator,
    name: &str,
    req: RollbackRequest,
) -> Result<Deployment> {
    let deployment = engine
        .rollout()
        .force_rollback(name, req.reason.as_deref())
        .await?;

    tracing::info!(
        "Environment {} rolled back, now serving {}",
        name,
        deployment.current_version.as_deref().unwrap_or("nothing")
    );

    Ok(deployment)
}
