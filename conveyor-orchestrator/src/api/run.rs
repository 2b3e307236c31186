//! Run API Handlers
//!
//! HTTP endpoints for triggering, inspecting and controlling runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conveyor_core::domain::run::{Run, RunEvent};
use conveyor_core::domain::trigger::TriggerNotification;
use conveyor_core::dto::gate::GateOverrideRequest;
use conveyor_core::dto::run::{ListRunsQuery, RunSummary};
use conveyor_core::dto::trigger::TriggerAccepted;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::engine::Orchestrator;
use crate::engine::error::TriggerError;
use crate::service::run_service;

// =============================================================================
// Trigger
// =============================================================================

/// POST /trigger
/// Admit a run for a change notification. A duplicate within the dedup
/// window answers 409 with the existing run.
pub async fn trigger(
    State(engine): State<Arc<Orchestrator>>,
    Json(notification): Json<TriggerNotification>,
) -> ApiResult<(StatusCode, Json<TriggerAccepted>)> {
    match run_service::trigger_run(&engine, &notification).await {
        Ok(run_id) => Ok((
            StatusCode::ACCEPTED,
            Json(TriggerAccepted {
                run_id,
                duplicate: false,
            }),
        )),
        Err(TriggerError::Duplicate(run_id)) => Ok((
            StatusCode::CONFLICT,
            Json(TriggerAccepted {
                run_id,
                duplicate: true,
            }),
        )),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Inspection
// =============================================================================

/// GET /run/list
/// List runs, filtered by pipeline and status
pub async fn list_runs(
    State(engine): State<Arc<Orchestrator>>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    tracing::debug!("Listing runs: {:?}", query);

    let runs = run_service::list_runs(engine.repositories(), &query).await?;

    Ok(Json(runs))
}

/// GET /run/{id}
/// Get run details by ID
pub async fn get_run(
    State(engine): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    let run = run_service::get_run(engine.repositories(), id).await?;

    Ok(Json(run))
}

/// GET /run/{id}/events
/// Get the event log of a run
pub async fn get_run_events(
    State(engine): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<RunEvent>>> {
    let events = run_service::get_run_events(engine.repositories(), id).await?;

    Ok(Json(events))
}

// =============================================================================
// Control
// =============================================================================

/// POST /run/{id}/cancel
/// Request cancellation of a run
pub async fn cancel_run(
    State(engine): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    tracing::info!("Cancelling run: {}", id);

    let run = run_service::cancel_run(&engine, id).await?;

    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// POST /run/{id}/gate/override
/// Bypass a failing quality gate verdict
pub async fn override_gate(
    State(engine): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Json(req): Json<GateOverrideRequest>,
) -> ApiResult<Json<Run>> {
    tracing::info!("Gate override requested for run: {}", id);

    let run = run_service::override_gate(&engine, id, req).await?;

    Ok(Json(run))
}
