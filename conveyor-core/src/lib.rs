//! Conveyor Core
//!
//! Core types and abstractions for the Conveyor pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: Core business entities (PipelineDefinition, Run, Artifact, etc.)
//! - DTOs: Data transfer objects for the HTTP API and its clients

pub mod domain;
pub mod dto;
