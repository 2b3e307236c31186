use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_orchestrator::api;
use conveyor_orchestrator::config::Config;
use conveyor_orchestrator::db;
use conveyor_orchestrator::engine::Orchestrator;
use conveyor_orchestrator::engine::adapter::AdapterRegistry;
use conveyor_orchestrator::engine::target::{
    DeployTarget, HealthProbe, HttpDeployTarget, HttpHealthProbe, LoggingDeployTarget,
    StaticHealthProbe,
};
use conveyor_orchestrator::repository::Repositories;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conveyor Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;

    if config.trigger_secret.is_empty() {
        warn!("TRIGGER_SECRET is not set, every trigger will be rejected");
    }

    let repos = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = connect_with_retry(url).await?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Repositories::postgres(pool)
        }
        None => {
            warn!("DATABASE_URL is not set, state is kept in memory only");
            Repositories::in_memory()
        }
    };

    let target: Arc<dyn DeployTarget> = match &config.deploy_webhook_url {
        Some(url) => Arc::new(HttpDeployTarget::new(url.clone(), config.collaborator_timeout)?),
        None => {
            warn!("DEPLOY_WEBHOOK_URL is not set, deployments are only logged");
            Arc::new(LoggingDeployTarget)
        }
    };
    let probe: Arc<dyn HealthProbe> = match &config.health_url_template {
        Some(template) => Arc::new(HttpHealthProbe::new(
            template.clone(),
            config.collaborator_timeout,
        )?),
        None => {
            warn!("HEALTH_URL_TEMPLATE is not set, environments always report healthy");
            Arc::new(StaticHealthProbe)
        }
    };

    let engine = Arc::new(Orchestrator::new(
        repos,
        config.engine_settings(),
        AdapterRegistry::default(),
        target,
        probe,
    ));

    let report = engine
        .recover()
        .await
        .context("Failed to recover state from previous run")?;
    info!(
        "Recovery complete: {} environment(s), {} run(s) resumed",
        report.environments, report.runs
    );

    let workers = engine.spawn_workers(config.worker_count);
    info!("Started {} worker(s)", workers.len());

    // Build router with all API endpoints
    let app = api::create_router(engine);

    info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for worker in workers {
        worker.abort();
    }
    info!("Orchestrator stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Connects to the database with exponential backoff
///
/// The database may still be starting when the orchestrator comes up
/// (common in container environments).
async fn connect_with_retry(database_url: &str) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match db::create_pool(database_url).await {
            Ok(pool) => {
                info!("Database connection pool created");
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(anyhow::anyhow!(
                        "Failed to connect to database after {} attempts: {}",
                        MAX_RETRIES,
                        e
                    ));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
