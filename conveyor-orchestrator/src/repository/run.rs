//! Run Repository
//!
//! Keeps the latest snapshot of every run plus its append-only event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::run::{Run, RunEvent, RunEventKind, RunStatus};
use conveyor_core::dto::run::ListRunsQuery;
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RepositoryError, Result};

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn insert(&self, run: &Run) -> Result<()>;

    /// Replaces the stored snapshot of an existing run
    async fn save(&self, run: &Run) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<Run>>;

    /// Lists runs, newest first
    async fn list(&self, query: &ListRunsQuery) -> Result<Vec<Run>>;

    /// Lists runs in a given status, oldest first
    async fn find_by_status(&self, status: RunStatus) -> Result<Vec<Run>>;

    /// Appends a transition to the run's event log, assigning the next sequence
    async fn append_event(&self, run_id: Uuid, kind: RunEventKind) -> Result<RunEvent>;

    async fn events(&self, run_id: Uuid) -> Result<Vec<RunEvent>>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    snapshot: Json<Run>,
}

#[derive(sqlx::FromRow)]
struct RunEventRow {
    run_id: Uuid,
    sequence: i64,
    at: DateTime<Utc>,
    kind: Json<RunEventKind>,
}

impl From<RunEventRow> for RunEvent {
    fn from(row: RunEventRow) -> Self {
        RunEvent {
            run_id: row.run_id,
            sequence: row.sequence,
            at: row.at,
            kind: row.kind.0,
        }
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn insert(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, pipeline, repository, branch, change_ref, status,
                              snapshot, requested_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(&run.pipeline)
        .bind(&run.trigger.repository)
        .bind(&run.trigger.branch)
        .bind(&run.trigger.change_ref)
        .bind(run.status.to_string())
        .bind(Json(run))
        .bind(run.requested_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save(&self, run: &Run) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $1, snapshot = $2, completed_at = $3
            WHERE id = $4
            "#,
        )
        .bind(run.status.to_string())
        .bind(Json(run))
        .bind(run.completed_at)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Corrupt(format!(
                "run {} does not exist",
                run.id
            )));
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>("SELECT snapshot FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.snapshot.0))
    }

    async fn list(&self, query: &ListRunsQuery) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT snapshot FROM runs
            WHERE ($1::TEXT IS NULL OR pipeline = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY requested_at DESC
            "#,
        )
        .bind(query.pipeline.as_deref())
        .bind(query.status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.snapshot.0).collect())
    }

    async fn find_by_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT snapshot FROM runs WHERE status = $1 ORDER BY requested_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.snapshot.0).collect())
    }

    async fn append_event(&self, run_id: Uuid, kind: RunEventKind) -> Result<RunEvent> {
        let at = Utc::now();

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO run_events (run_id, sequence, at, kind)
            SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3
            FROM run_events WHERE run_id = $1
            RETURNING sequence
            "#,
        )
        .bind(run_id)
        .bind(at)
        .bind(Json(&kind))
        .fetch_one(&self.pool)
        .await?;

        Ok(RunEvent {
            run_id,
            sequence,
            at,
            kind,
        })
    }

    async fn events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        let rows = sqlx::query_as::<_, RunEventRow>(
            r#"
            SELECT run_id, sequence, at, kind
            FROM run_events
            WHERE run_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<Uuid, Run>>,
    events: RwLock<HashMap<Uuid, Vec<RunEvent>>>,
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn insert(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            )));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(RepositoryError::Corrupt(format!(
                "run {} does not exist",
                run.id
            ))),
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list(&self, query: &ListRunsQuery) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| query.pipeline.as_ref().is_none_or(|p| &r.pipeline == p))
            .filter(|r| query.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(runs)
    }

    async fn find_by_status(&self, status: RunStatus) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(runs)
    }

    async fn append_event(&self, run_id: Uuid, kind: RunEventKind) -> Result<RunEvent> {
        let mut events = self.events.write().await;
        let log = events.entry(run_id).or_default();
        let event = RunEvent {
            run_id,
            sequence: log.len() as i64 + 1,
            at: Utc::now(),
            kind,
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
