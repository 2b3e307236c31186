//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::engine::error::{ArtifactPublishError, GateError, RolloutError, TriggerError};
use crate::repository::RepositoryError;
use crate::service::pipeline_service::PipelineError;
use crate::service::run_service::RunError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    ServiceUnavailable(String),
    RepositoryError(RepositoryError),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::RepositoryError(err) => {
                tracing::error!("Repository error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        ApiError::RepositoryError(err)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(name) => ApiError::NotFound(format!("Pipeline {} not found", name)),
            PipelineError::ValidationError(msg) => ApiError::BadRequest(msg),
            PipelineError::Conflict(msg) => ApiError::Conflict(msg),
            PipelineError::RepositoryError(err) => ApiError::RepositoryError(err),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::NotFound(id) => ApiError::NotFound(format!("Run {} not found", id)),
            RunError::InvalidState(msg) => ApiError::Conflict(msg),
            RunError::RepositoryError(err) => ApiError::RepositoryError(err),
            RunError::EngineError(err) => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Validation(_) | TriggerError::InvalidSignature => {
                ApiError::BadRequest(err.to_string())
            }
            TriggerError::UnknownRepository(_) => ApiError::NotFound(err.to_string()),
            TriggerError::Duplicate(_) => ApiError::Conflict(err.to_string()),
            TriggerError::QueueFull => ApiError::ServiceUnavailable(err.to_string()),
            TriggerError::Repository(err) => ApiError::RepositoryError(err),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::RunNotFound(id) => ApiError::NotFound(format!("Run {} not found", id)),
            GateError::UnknownToken => ApiError::Forbidden(err.to_string()),
            GateError::NotFailing(_) | GateError::RunActive(_) => ApiError::Conflict(err.to_string()),
            GateError::Repository(err) => ApiError::RepositoryError(err),
        }
    }
}

impl From<RolloutError> for ApiError {
    fn from(err: RolloutError) -> Self {
        match err {
            RolloutError::EnvironmentNotFound(_) => ApiError::NotFound(err.to_string()),
            RolloutError::Rejected { .. } | RolloutError::NothingToRollBack(_) => {
                ApiError::Conflict(err.to_string())
            }
            RolloutError::Repository(err) => ApiError::RepositoryError(err),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<ArtifactPublishError> for ApiError {
    fn from(err: ArtifactPublishError) -> Self {
        match err {
            ArtifactPublishError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            ArtifactPublishError::StoreUnavailable(_) => ApiError::ServiceUnavailable(err.to_string()),
            other => ApiError::Conflict(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
