//! Gate override DTOs

use serde::{Deserialize, Serialize};

/// Request to bypass a failing quality gate verdict.
///
/// The actor recorded in the audit log is the owner of `token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOverrideRequest {
    pub token: String,
    #[serde(default)]
    pub reason: Option<String>,
}
