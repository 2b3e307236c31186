//! Environment Repository
//!
//! Per-environment rollout records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::deployment::{Deployment, HealthSample, InFlightRollout};
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::RwLock;

use super::{RepositoryError, Result};

#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    async fn find(&self, environment: &str) -> Result<Option<Deployment>>;

    /// Inserts or replaces the rollout record of an environment
    async fn save(&self, deployment: &Deployment) -> Result<()>;

    async fn list(&self) -> Result<Vec<Deployment>>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgEnvironmentRepository {
    pool: PgPool,
}

impl PgEnvironmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    name: String,
    state: String,
    pipeline: Option<String>,
    current_version: Option<String>,
    previous_version: Option<String>,
    in_flight: Option<Json<InFlightRollout>>,
    health_history: Json<VecDeque<HealthSample>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EnvironmentRow> for Deployment {
    type Error = RepositoryError;

    fn try_from(row: EnvironmentRow) -> Result<Self> {
        Ok(Deployment {
            environment: row.name,
            state: row.state.parse().map_err(RepositoryError::Corrupt)?,
            pipeline: row.pipeline,
            current_version: row.current_version,
            previous_version: row.previous_version,
            in_flight: row.in_flight.map(|j| j.0),
            health_history: row.health_history.0,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl EnvironmentRepository for PgEnvironmentRepository {
    async fn find(&self, environment: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            r#"
            SELECT name, state, pipeline, current_version, previous_version,
                   in_flight, health_history, updated_at
            FROM environments
            WHERE name = $1
            "#,
        )
        .bind(environment)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Deployment::try_from).transpose()
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO environments (name, state, pipeline, current_version, previous_version,
                                      in_flight, health_history, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO UPDATE
            SET state = EXCLUDED.state,
                pipeline = EXCLUDED.pipeline,
                current_version = EXCLUDED.current_version,
                previous_version = EXCLUDED.previous_version,
                in_flight = EXCLUDED.in_flight,
                health_history = EXCLUDED.health_history,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&deployment.environment)
        .bind(deployment.state.to_string())
        .bind(&deployment.pipeline)
        .bind(&deployment.current_version)
        .bind(&deployment.previous_version)
        .bind(deployment.in_flight.as_ref().map(Json))
        .bind(Json(&deployment.health_history))
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(
            r#"
            SELECT name, state, pipeline, current_version, previous_version,
                   in_flight, health_history, updated_at
            FROM environments
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Deployment::try_from).collect()
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct InMemoryEnvironmentRepository {
    environments: RwLock<BTreeMap<String, Deployment>>,
}

#[async_trait]
impl EnvironmentRepository for InMemoryEnvironmentRepository {
    async fn find(&self, environment: &str) -> Result<Option<Deployment>> {
        Ok(self.environments.read().await.get(environment).cloned())
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        self.environments
            .write()
            .await
            .insert(deployment.environment.clone(), deployment.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        Ok(self.environments.read().await.values().cloned().collect())
    }
}
