//! Conveyor Lua Infrastructure
//!
//! Sandboxed evaluation of Lua pipeline scripts. Scripts run without I/O and
//! return a table that is converted into a
//! [`PipelineDefinition`](conveyor_core::domain::pipeline::PipelineDefinition).

pub mod parser;
pub mod sandbox;

pub use parser::parse_pipeline_definition;
pub use sandbox::create_sandbox;
