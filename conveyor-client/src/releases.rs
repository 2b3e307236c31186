//! Artifact, environment and gate audit endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use conveyor_core::domain::artifact::Artifact;
use conveyor_core::domain::deployment::Deployment;
use conveyor_core::domain::gate::GateBypass;
use conveyor_core::dto::environment::RollbackRequest;
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Artifacts
    // =============================================================================

    /// List artifacts, optionally for one pipeline
    pub async fn list_artifacts(&self, pipeline: Option<&str>) -> Result<Vec<Artifact>> {
        let url = format!("{}/artifact/list", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(pipeline) = pipeline {
            request = request.query(&[("pipeline", pipeline)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Get one artifact version of a pipeline
    pub async fn get_artifact(&self, pipeline: &str, version: &str) -> Result<Artifact> {
        let url = format!("{}/artifact/{}/{}", self.base_url, pipeline, version);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Environments
    // =============================================================================

    /// List all environments with a rollout record
    pub async fn list_environments(&self) -> Result<Vec<Deployment>> {
        let url = format!("{}/environment/list", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the rollout record of an environment
    pub async fn get_environment(&self, name: &str) -> Result<Deployment> {
        let url = format!("{}/environment/{}", self.base_url, name);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Force a rollback of an environment to its previous version
    pub async fn rollback_environment(&self, name: &str, reason: Option<String>) -> Result<Deployment> {
        let url = format!("{}/environment/{}/rollback", self.base_url, name);
        let response = self
            .client
            .post(&url)
            .json(&RollbackRequest { reason })
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Gate audit
    // =============================================================================

    /// List gate bypass audit entries, optionally for one run
    pub async fn gate_audit(&self, run_id: Option<Uuid>) -> Result<Vec<GateBypass>> {
        let url = format!("{}/gate/audit", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(run_id) = run_id {
            request = request.query(&[("runId", run_id.to_string())]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }
}
