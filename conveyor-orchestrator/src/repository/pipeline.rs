//! Pipeline Repository
//!
//! Stores pipeline definitions keyed by name.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::domain::pipeline::PipelineDefinition;
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::Result;

#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Inserts the definition or replaces the one with the same name
    async fn upsert(&self, definition: &PipelineDefinition) -> Result<()>;

    async fn find(&self, name: &str) -> Result<Option<PipelineDefinition>>;

    /// Finds the pipeline bound to a source repository
    async fn find_by_repository(&self, repository: &str) -> Result<Option<PipelineDefinition>>;

    async fn list(&self) -> Result<Vec<PipelineDefinition>>;

    /// Returns whether a pipeline was deleted
    async fn delete(&self, name: &str) -> Result<bool>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgPipelineRepository {
    pool: PgPool,
}

impl PgPipelineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    definition: Json<PipelineDefinition>,
}

#[async_trait]
impl PipelineRepository for PgPipelineRepository {
    async fn upsert(&self, definition: &PipelineDefinition) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO pipelines (name, repository, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (name) DO UPDATE
            SET repository = EXCLUDED.repository,
                definition = EXCLUDED.definition,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.repository)
        .bind(Json(definition))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<PipelineDefinition>> {
        let row = sqlx::query_as::<_, PipelineRow>(
            "SELECT definition FROM pipelines WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.definition.0))
    }

    async fn find_by_repository(&self, repository: &str) -> Result<Option<PipelineDefinition>> {
        let row = sqlx::query_as::<_, PipelineRow>(
            "SELECT definition FROM pipelines WHERE repository = $1",
        )
        .bind(repository)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.definition.0))
    }

    async fn list(&self) -> Result<Vec<PipelineDefinition>> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            "SELECT definition FROM pipelines ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.definition.0).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pipelines WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct InMemoryPipelineRepository {
    pipelines: RwLock<BTreeMap<String, PipelineDefinition>>,
}

#[async_trait]
impl PipelineRepository for InMemoryPipelineRepository {
    async fn upsert(&self, definition: &PipelineDefinition) -> Result<()> {
        self.pipelines
            .write()
            .await
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<PipelineDefinition>> {
        Ok(self.pipelines.read().await.get(name).cloned())
    }

    async fn find_by_repository(&self, repository: &str) -> Result<Option<PipelineDefinition>> {
        Ok(self
            .pipelines
            .read()
            .await
            .values()
            .find(|p| p.repository == repository)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<PipelineDefinition>> {
        Ok(self.pipelines.read().await.values().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.pipelines.write().await.remove(name).is_some())
    }
}
