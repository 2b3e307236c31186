//! Client for the Conveyor orchestrator REST API
//!
//! Wraps pipeline registration, signed triggers, run inspection and the
//! release endpoints (artifacts, environments, gate overrides). The CLI is
//! the main consumer; CI systems can use it to submit notifications.
//!
//! ```no_run
//! use conveyor_client::OrchestratorClient;
//! use conveyor_core::dto::run::ListRunsQuery;
//!
//! # async fn failed_runs() -> conveyor_client::Result<()> {
//! let client = OrchestratorClient::new("http://localhost:8080");
//! let query = ListRunsQuery {
//!     pipeline: Some("api".to_string()),
//!     ..ListRunsQuery::default()
//! };
//! for run in client.list_runs(&query).await? {
//!     println!("{} {}", run.id, run.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod pipelines;
mod releases;
mod runs;

pub use error::{ClientError, Result};

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

/// Handle to one orchestrator instance
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Without a trailing slash
    base_url: String,
    client: Client,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Uses a preconfigured reqwest client, e.g. one with request timeouts
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Turns a non-2xx response into [`ClientError::ApiError`] carrying the
    /// orchestrator's error body
    async fn ensure_success(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        tracing::debug!("Orchestrator returned {}: {}", status, body);
        Err(ClientError::api_error(status.as_u16(), body))
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        Self::ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// For endpoints answering `204 No Content`
    async fn handle_empty_response(&self, response: Response) -> Result<()> {
        Self::ensure_success(response).await.map(|_| ())
    }
}
