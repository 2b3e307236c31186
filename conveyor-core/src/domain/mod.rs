//! Core domain types
//!
//! This module contains the core domain structures used across Conveyor crates.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (persistence and execution), the client and the CLI.

pub mod artifact;
pub mod deployment;
pub mod gate;
pub mod graph;
pub mod pipeline;
pub mod run;
pub mod trigger;
