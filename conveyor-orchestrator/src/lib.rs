//! Conveyor Orchestrator
//!
//! Pipeline orchestration service: admits change triggers, executes stage
//! DAGs, enforces quality gates, tracks artifacts and rolls deployments
//! out progressively with automatic rollback.

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod repository;
pub mod service;
