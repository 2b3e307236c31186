//! Data Transfer Objects for the HTTP API
//!
//! Request and response bodies exchanged between the orchestrator and its
//! clients. Domain records are returned as-is where they already serialize
//! well; these types cover the requests and condensed listings.

pub mod environment;
pub mod gate;
pub mod pipeline;
pub mod run;
pub mod trigger;
