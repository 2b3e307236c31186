//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};
use conveyor_core::domain::run::{Run, RunEvent};
use conveyor_core::domain::trigger::TriggerNotification;
use conveyor_core::dto::gate::GateOverrideRequest;
use conveyor_core::dto::run::{ListRunsQuery, RunSummary};
use conveyor_core::dto::trigger::TriggerAccepted;
use reqwest::StatusCode;
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Triggering
    // =============================================================================

    /// Submit a change notification
    ///
    /// A duplicate within the orchestrator's dedup window is not an error:
    /// the existing run is returned with `duplicate` set.
    ///
    /// # Example
    /// ```no_run
    /// # use conveyor_client::OrchestratorClient;
    /// # use conveyor_core::domain::trigger::TriggerNotification;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let notification = TriggerNotification::signed("acme/api", "main", "4f2a9c1", "s3cret");
    /// let accepted = client.trigger(&notification).await?;
    /// println!("run {}", accepted.run_id);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn trigger(&self, notification: &TriggerNotification) -> Result<TriggerAccepted> {
        let url = format!("{}/trigger", self.base_url);
        let response = self.client.post(&url).json(notification).send().await?;

        if response.status() == StatusCode::CONFLICT {
            return response
                .json()
                .await
                .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)));
        }

        self.handle_response(response).await
    }

    // =============================================================================
    // Inspection
    // =============================================================================

    /// List runs, optionally filtered by pipeline and status
    pub async fn list_runs(&self, query: &ListRunsQuery) -> Result<Vec<RunSummary>> {
        let url = format!("{}/run/list", self.base_url);
        let mut params = Vec::new();
        if let Some(pipeline) = &query.pipeline {
            params.push(("pipeline", pipeline.clone()));
        }
        if let Some(status) = query.status {
            params.push(("status", status.to_string()));
        }
        let response = self.client.get(&url).query(&params).send().await?;

        self.handle_response(response).await
    }

    /// Get a run by ID
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let url = format!("{}/run/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the event log of a run
    pub async fn get_run_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>> {
        let url = format!("{}/run/{}/events", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Control
    // =============================================================================

    /// Request cancellation of a run
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        let url = format!("{}/run/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Bypass a failing quality gate verdict
    ///
    /// # Arguments
    /// * `run_id` - The run whose verdict is waived
    /// * `req` - Bypass token and an optional reason for the audit log
    pub async fn override_gate(&self, run_id: Uuid, req: &GateOverrideRequest) -> Result<Run> {
        let url = format!("{}/run/{}/gate/override", self.base_url, run_id);
        let response = self.client.post(&url).json(req).send().await?;

        self.handle_response(response).await
    }
}
