//! Artifact Repository
//!
//! Versioned artifact registry. `(pipeline, version)` is unique.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::artifact::{Artifact, ArtifactState};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RepositoryError, Result};

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Inserts a new artifact; an existing `(pipeline, version)` is a conflict
    async fn insert(&self, artifact: &Artifact) -> Result<()>;

    /// Persists the mutable lifecycle fields of an artifact
    async fn save(&self, artifact: &Artifact) -> Result<()>;

    async fn find(&self, pipeline: &str, version: &str) -> Result<Option<Artifact>>;

    /// Lists artifacts, most recently registered first
    async fn list(&self, pipeline: Option<&str>) -> Result<Vec<Artifact>>;

    /// Artifacts of a pipeline in a state, least recently updated first
    async fn find_by_state(&self, pipeline: &str, state: ArtifactState) -> Result<Vec<Artifact>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgArtifactRepository {
    pool: PgPool,
}

impl PgArtifactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: Uuid,
    pipeline: String,
    version: String,
    content_ref: String,
    run_id: Uuid,
    state: String,
    registered_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = RepositoryError;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        Ok(Artifact {
            id: row.id,
            pipeline: row.pipeline,
            version: row.version,
            content_ref: row.content_ref,
            run_id: row.run_id,
            state: row.state.parse().map_err(RepositoryError::Corrupt)?,
            registered_at: row.registered_at,
            released_at: row.released_at,
            updated_at: row.updated_at,
        })
    }
}

const ARTIFACT_COLUMNS: &str =
    "id, pipeline, version, content_ref, run_id, state, registered_at, released_at, updated_at";

fn into_artifacts(rows: Vec<ArtifactRow>) -> Result<Vec<Artifact>> {
    rows.into_iter().map(Artifact::try_from).collect()
}

#[async_trait]
impl ArtifactRepository for PgArtifactRepository {
    async fn insert(&self, artifact: &Artifact) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO artifacts (id, pipeline, version, content_ref, run_id, state,
                                   registered_at, released_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (pipeline, version) DO NOTHING
            "#,
        )
        .bind(artifact.id)
        .bind(&artifact.pipeline)
        .bind(&artifact.version)
        .bind(&artifact.content_ref)
        .bind(artifact.run_id)
        .bind(artifact.state.to_string())
        .bind(artifact.registered_at)
        .bind(artifact.released_at)
        .bind(artifact.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "artifact {}@{} already exists",
                artifact.pipeline, artifact.version
            )));
        }
        Ok(())
    }

    async fn save(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE artifacts
            SET state = $1, released_at = $2, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(artifact.state.to_string())
        .bind(artifact.released_at)
        .bind(artifact.updated_at)
        .bind(artifact.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, pipeline: &str, version: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query_as::<_, ArtifactRow>(&format!(
            "SELECT {} FROM artifacts WHERE pipeline = $1 AND version = $2",
            ARTIFACT_COLUMNS
        ))
        .bind(pipeline)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Artifact::try_from).transpose()
    }

    async fn list(&self, pipeline: Option<&str>) -> Result<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(&format!(
            r#"
            SELECT {} FROM artifacts
            WHERE ($1::TEXT IS NULL OR pipeline = $1)
            ORDER BY registered_at DESC
            "#,
            ARTIFACT_COLUMNS
        ))
        .bind(pipeline)
        .fetch_all(&self.pool)
        .await?;

        into_artifacts(rows)
    }

    async fn find_by_state(&self, pipeline: &str, state: ArtifactState) -> Result<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(&format!(
            r#"
            SELECT {} FROM artifacts
            WHERE pipeline = $1 AND state = $2
            ORDER BY updated_at ASC
            "#,
            ARTIFACT_COLUMNS
        ))
        .bind(pipeline)
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await?;

        into_artifacts(rows)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM artifacts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct InMemoryArtifactRepository {
    artifacts: RwLock<HashMap<Uuid, Artifact>>,
}

#[async_trait]
impl ArtifactRepository for InMemoryArtifactRepository {
    async fn insert(&self, artifact: &Artifact) -> Result<()> {
        let mut artifacts = self.artifacts.write().await;
        if artifacts
            .values()
            .any(|a| a.pipeline == artifact.pipeline && a.version == artifact.version)
        {
            return Err(RepositoryError::Conflict(format!(
                "artifact {}@{} already exists",
                artifact.pipeline, artifact.version
            )));
        }
        artifacts.insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn save(&self, artifact: &Artifact) -> Result<()> {
        self.artifacts
            .write()
            .await
            .insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn find(&self, pipeline: &str, version: &str) -> Result<Option<Artifact>> {
        Ok(self
            .artifacts
            .read()
            .await
            .values()
            .find(|a| a.pipeline == pipeline && a.version == version)
            .cloned())
    }

    async fn list(&self, pipeline: Option<&str>) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .artifacts
            .read()
            .await
            .values()
            .filter(|a| pipeline.is_none_or(|p| a.pipeline == p))
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
        Ok(artifacts)
    }

    async fn find_by_state(&self, pipeline: &str, state: ArtifactState) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .artifacts
            .read()
            .await
            .values()
            .filter(|a| a.pipeline == pipeline && a.state == state)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(artifacts)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.artifacts.write().await.remove(&id).is_some())
    }
}
