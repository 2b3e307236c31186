//! Gate Service
//!
//! Read access to the gate bypass audit log.

use conveyor_core::domain::gate::GateBypass;
use uuid::Uuid;

use crate::engine::Orchestrator;
use crate::engine::error::GateError;

/// List bypass audit entries, optionally for a single run
pub async fn audit_log(engine: &Orchestrator, run_id: Option<Uuid>) -> Result<Vec<GateBypass>, GateError> {
    engine.gate().audit_log(run_id).await
}
