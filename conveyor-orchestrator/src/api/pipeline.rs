//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline management.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use conveyor_core::domain::pipeline::PipelineDefinition;
use conveyor_core::dto::pipeline::{CreatePipeline, PipelineSummary};
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::engine::Orchestrator;
use crate::service::pipeline_service;

/// POST /pipeline/create
/// Register or replace a pipeline
pub async fn create_pipeline(
    State(engine): State<Arc<Orchestrator>>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<(StatusCode, Json<PipelineDefinition>)> {
    let definition = pipeline_service::create_pipeline(engine.repositories(), req).await?;

    Ok((StatusCode::CREATED, Json(definition)))
}

/// GET /pipeline/list
/// List all pipelines
pub async fn list_pipelines(
    State(engine): State<Arc<Orchestrator>>,
) -> ApiResult<Json<Vec<PipelineSummary>>> {
    tracing::debug!("Listing all pipelines");

    let pipelines = pipeline_service::list_pipelines(engine.repositories()).await?;

    Ok(Json(pipelines))
}

/// GET /pipeline/{name}
/// Get pipeline by name
pub async fn get_pipeline(
    State(engine): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineDefinition>> {
    tracing::debug!("Getting pipeline: {}", name);

    let pipeline = pipeline_service::get_pipeline(engine.repositories(), &name).await?;

    Ok(Json(pipeline))
}

/// DELETE /pipeline/{name}
/// Delete a pipeline
pub async fn delete_pipeline(
    State(engine): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting pipeline: {}", name);

    pipeline_service::delete_pipeline(engine.repositories(), &name).await?;

    Ok(StatusCode::NO_CONTENT)
}
