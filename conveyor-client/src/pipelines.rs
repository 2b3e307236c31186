//! Pipeline-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use conveyor_core::domain::pipeline::PipelineDefinition;
use conveyor_core::dto::pipeline::{CreatePipeline, PipelineSummary};

impl OrchestratorClient {
    // =============================================================================
    // Pipeline Management
    // =============================================================================

    /// Register or replace a pipeline
    ///
    /// # Arguments
    /// * `req` - Lua script or JSON definition of the pipeline
    ///
    /// # Returns
    /// The validated definition as stored by the orchestrator
    ///
    /// # Example
    /// ```no_run
    /// # use conveyor_client::OrchestratorClient;
    /// # use conveyor_core::dto::pipeline::CreatePipeline;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let script = std::fs::read_to_string("pipeline.lua")?;
    /// let definition = client
    ///     .create_pipeline(CreatePipeline::from_script(script))
    ///     .await?;
    /// println!("{} has {} stages", definition.name, definition.stages.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create_pipeline(&self, req: CreatePipeline) -> Result<PipelineDefinition> {
        let url = format!("{}/pipeline/create", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// List all pipelines
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let url = format!("{}/pipeline/list", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get a pipeline definition by name
    pub async fn get_pipeline(&self, name: &str) -> Result<PipelineDefinition> {
        let url = format!("{}/pipeline/{}", self.base_url, name);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Delete a pipeline
    pub async fn delete_pipeline(&self, name: &str) -> Result<()> {
        let url = format!("{}/pipeline/{}", self.base_url, name);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
