//! Release API Handlers
//!
//! HTTP endpoints for artifacts, environments and the gate audit log.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use conveyor_core::domain::artifact::Artifact;
use conveyor_core::domain::deployment::Deployment;
use conveyor_core::domain::gate::GateBypass;
use conveyor_core::dto::environment::RollbackRequest;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::engine::Orchestrator;
use crate::service::{artifact_service, environment_service, gate_service};

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub pipeline: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub run_id: Option<Uuid>,
}

// =============================================================================
// Artifacts
// =============================================================================

/// GET /artifact/list
pub async fn list_artifacts(
    State(engine): State<Arc<Orchestrator>>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<Json<Vec<Artifact>>> {
    let artifacts = artifact_service::list_artifacts(&engine, query.pipeline.as_deref()).await?;

    Ok(Json(artifacts))
}

/// GET /artifact/{pipeline}/{version}
pub async fn get_artifact(
    State(engine): State<Arc<Orchestrator>>,
    Path((pipeline, version)): Path<(String, String)>,
) -> ApiResult<Json<Artifact>> {
    let artifact = artifact_service::get_artifact(&engine, &pipeline, &version).await?;

    Ok(Json(artifact))
}

// =============================================================================
// Environments
// =============================================================================

/// GET /environment/list
pub async fn list_environments(
    State(engine): State<Arc<Orchestrator>>,
) -> ApiResult<Json<Vec<Deployment>>> {
    let environments = environment_service::list_environments(&engine).await?;

    Ok(Json(environments))
}

/// GET /environment/{name}
pub async fn get_environment(
    State(engine): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Deployment>> {
    let deployment = environment_service::get_environment(&engine, &name).await?;

    Ok(Json(deployment))
}

/// POST /environment/{name}/rollback
/// Operator-forced rollback
pub async fn rollback_environment(
    State(engine): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<Json<Deployment>> {
    tracing::info!("Forced rollback requested for environment: {}", name);

    let deployment = environment_service::rollback_environment(&engine, &name, req).await?;

    Ok(Json(deployment))
}

// =============================================================================
// Gate audit
// =============================================================================

/// GET /gate/audit
pub async fn gate_audit(
    State(engine): State<Arc<Orchestrator>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<GateBypass>>> {
    let entries = gate_service::audit_log(&engine, query.run_id).await?;

    Ok(Json(entries))
}
