//! Trigger DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response to an accepted (202) or duplicate (409) trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerAccepted {
    pub run_id: Uuid,
    #[serde(default)]
    pub duplicate: bool,
}
