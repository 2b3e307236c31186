//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services sit between the HTTP API and the repositories and engine.

pub mod artifact;
pub mod environment;
pub mod gate;
pub mod pipeline;
pub mod run;

// Re-export for convenience
pub use artifact as artifact_service;
pub use environment as environment_service;
pub use gate as gate_service;
pub use pipeline as pipeline_service;
pub use run as run_service;
