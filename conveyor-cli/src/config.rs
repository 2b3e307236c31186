//! Configuration module
//!
//! Handles CLI configuration including the orchestrator URL.

use std::time::Duration;

/// Delay between polls while waiting for a run to finish
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,
}
