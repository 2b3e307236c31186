//! Gate Audit Repository
//!
//! Append-only log of quality gate bypasses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::gate::GateBypass;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Result;

#[async_trait]
pub trait GateAuditRepository: Send + Sync {
    async fn append(&self, entry: &GateBypass) -> Result<()>;

    /// Lists audit entries oldest first, optionally for a single run
    async fn list(&self, run_id: Option<Uuid>) -> Result<Vec<GateBypass>>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgGateAuditRepository {
    pool: PgPool,
}

impl PgGateAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct GateAuditRow {
    id: Uuid,
    run_id: Uuid,
    actor: String,
    at: DateTime<Utc>,
    waived_conditions: Vec<String>,
    reason: Option<String>,
}

impl From<GateAuditRow> for GateBypass {
    fn from(row: GateAuditRow) -> Self {
        GateBypass {
            id: row.id,
            run_id: row.run_id,
            actor: row.actor,
            at: row.at,
            waived_conditions: row.waived_conditions,
            reason: row.reason,
        }
    }
}

#[async_trait]
impl GateAuditRepository for PgGateAuditRepository {
    async fn append(&self, entry: &GateBypass) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gate_audit (id, run_id, actor, at, waived_conditions, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.run_id)
        .bind(&entry.actor)
        .bind(entry.at)
        .bind(&entry.waived_conditions)
        .bind(&entry.reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, run_id: Option<Uuid>) -> Result<Vec<GateBypass>> {
        let rows = sqlx::query_as::<_, GateAuditRow>(
            r#"
            SELECT id, run_id, actor, at, waived_conditions, reason
            FROM gate_audit
            WHERE ($1::UUID IS NULL OR run_id = $1)
            ORDER BY at ASC
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
pub struct InMemoryGateAuditRepository {
    entries: RwLock<Vec<GateBypass>>,
}

#[async_trait]
impl GateAuditRepository for InMemoryGateAuditRepository {
    async fn append(&self, entry: &GateBypass) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list(&self, run_id: Option<Uuid>) -> Result<Vec<GateBypass>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| run_id.is_none_or(|id| e.run_id == id))
            .cloned()
            .collect())
    }
}
