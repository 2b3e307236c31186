//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository is a trait with a Postgres implementation and an
//! in-memory implementation used when no database is configured.

pub mod artifact;
pub mod environment;
pub mod gate;
pub mod pipeline;
pub mod run;

use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;

pub use artifact::ArtifactRepository;
pub use environment::EnvironmentRepository;
pub use gate::GateAuditRepository;
pub use pipeline::PipelineRepository;
pub use run::RunRepository;

/// Repository error type
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to (de)serialize stored record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Set of repositories shared by the engine and the API
#[derive(Clone)]
pub struct Repositories {
    pub pipelines: Arc<dyn PipelineRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub environments: Arc<dyn EnvironmentRepository>,
    pub gate_audit: Arc<dyn GateAuditRepository>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            pipelines: Arc::new(pipeline::PgPipelineRepository::new(pool.clone())),
            runs: Arc::new(run::PgRunRepository::new(pool.clone())),
            artifacts: Arc::new(artifact::PgArtifactRepository::new(pool.clone())),
            environments: Arc::new(environment::PgEnvironmentRepository::new(pool.clone())),
            gate_audit: Arc::new(gate::PgGateAuditRepository::new(pool)),
        }
    }

    /// Process-local repositories; state is lost on restart
    pub fn in_memory() -> Self {
        Self {
            pipelines: Arc::new(pipeline::InMemoryPipelineRepository::default()),
            runs: Arc::new(run::InMemoryRunRepository::default()),
            artifacts: Arc::new(artifact::InMemoryArtifactRepository::default()),
            environments: Arc::new(environment::InMemoryEnvironmentRepository::default()),
            gate_audit: Arc::new(gate::InMemoryGateAuditRepository::default()),
        }
    }
}
