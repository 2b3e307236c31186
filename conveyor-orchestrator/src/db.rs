use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Pipeline definitions, one per repository
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            name VARCHAR(255) PRIMARY KEY,
            repository VARCHAR(512) NOT NULL UNIQUE,
            definition JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run snapshots
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            pipeline VARCHAR(255) NOT NULL,
            repository VARCHAR(512) NOT NULL,
            branch VARCHAR(255) NOT NULL,
            change_ref VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            snapshot JSONB NOT NULL,
            requested_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only run event log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_events (
            run_id UUID NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            sequence BIGINT NOT NULL,
            at TIMESTAMPTZ NOT NULL,
            kind JSONB NOT NULL,
            PRIMARY KEY (run_id, sequence)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Versioned artifact registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id UUID PRIMARY KEY,
            pipeline VARCHAR(255) NOT NULL,
            version VARCHAR(255) NOT NULL,
            content_ref TEXT NOT NULL,
            run_id UUID NOT NULL,
            state VARCHAR(50) NOT NULL,
            registered_at TIMESTAMPTZ NOT NULL,
            released_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL,
            UNIQUE (pipeline, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-environment rollout record
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS environments (
            name VARCHAR(255) PRIMARY KEY,
            state VARCHAR(50) NOT NULL,
            pipeline VARCHAR(255),
            current_version VARCHAR(255),
            previous_version VARCHAR(255),
            in_flight JSONB,
            health_history JSONB NOT NULL DEFAULT '[]',
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Gate bypass audit log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gate_audit (
            id UUID PRIMARY KEY,
            run_id UUID NOT NULL,
            actor VARCHAR(255) NOT NULL,
            at TIMESTAMPTZ NOT NULL,
            waived_conditions TEXT[] NOT NULL DEFAULT '{}',
            reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_requested_at ON runs(requested_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_state ON artifacts(pipeline, state)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_gate_audit_run_id ON gate_audit(run_id, at)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
