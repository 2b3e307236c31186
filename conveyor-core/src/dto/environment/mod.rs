//! Environment DTOs

use serde::{Deserialize, Serialize};

/// Request for an operator force-rollback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub reason: Option<String>,
}
