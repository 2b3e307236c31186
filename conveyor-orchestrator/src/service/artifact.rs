//! Artifact Service
//!
//! Read access to the artifact registry.

use conveyor_core::domain::artifact::Artifact;

use crate::engine::Orchestrator;
use crate::engine::error::ArtifactPublishError;

pub type Result<T> = std::result::Result<T, ArtifactPublishError>;

/// List artifacts, optionally for a single pipeline
pub async fn list_artifacts(engine: &Orchestrator, pipeline: Option<&str>) -> Result<Vec<Artifact>> {
    engine.artifacts().list(pipeline).await
}

/// Get one artifact version of a pipeline
pub async fn get_artifact(engine: &Orchestrator, pipeline: &str, version: &str) -> Result<Artifact> {
    engine
        .artifacts()
        .find(pipeline, version)
        .await?
        .ok_or_else(|| ArtifactPublishError::NotFound {
            version: format!("{}@{}", pipeline, version),
        })
}
