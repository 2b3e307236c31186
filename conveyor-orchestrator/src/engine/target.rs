//! Deployment collaborators
//!
//! The rollout controller drives an environment through a [`DeployTarget`]
//! and watches it through a [`HealthProbe`]. HTTP implementations talk to
//! an external deploy webhook and per-environment health endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use conveyor_core::domain::artifact::Artifact;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait DeployTarget: Send + Sync {
    /// Routes `traffic_percent` of the environment's traffic to `artifact`
    async fn apply(&self, environment: &str, artifact: &Artifact, traffic_percent: u8)
    -> Result<()>;

    /// Routes all traffic back to `version`, or removes the new version
    /// entirely when the environment had no previous release
    async fn revert(&self, environment: &str, version: Option<&str>) -> Result<()>;
}

/// Health signals reported by a probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Fraction of failing requests (0.0 - 1.0)
    pub error_rate: f64,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Takes one sample. An error counts as a failed probe.
    async fn sample(&self, environment: &str, traffic_percent: u8) -> Result<HealthReport>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "action")]
enum DeployCommand<'a> {
    Apply {
        environment: &'a str,
        pipeline: &'a str,
        version: &'a str,
        content_ref: &'a str,
        traffic_percent: u8,
    },
    Revert {
        environment: &'a str,
        version: Option<&'a str>,
    },
}

/// Posts deploy commands to a webhook
pub struct HttpDeployTarget {
    client: Client,
    url: String,
}

impl HttpDeployTarget {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build deploy webhook client")?;
        Ok(Self { client, url })
    }

    async fn send(&self, command: &DeployCommand<'_>) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(command)
            .send()
            .await
            .context("Failed to reach deploy webhook")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("deploy webhook returned {}: {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl DeployTarget for HttpDeployTarget {
    async fn apply(
        &self,
        environment: &str,
        artifact: &Artifact,
        traffic_percent: u8,
    ) -> Result<()> {
        self.send(&DeployCommand::Apply {
            environment,
            pipeline: &artifact.pipeline,
            version: &artifact.version,
            content_ref: &artifact.content_ref,
            traffic_percent,
        })
        .await
    }

    async fn revert(&self, environment: &str, version: Option<&str>) -> Result<()> {
        self.send(&DeployCommand::Revert {
            environment,
            version,
        })
        .await
    }
}

/// Polls `GET <template with {environment} substituted>`.
///
/// A 2xx response carrying `{"errorRate": <f64>}` is a successful sample;
/// a 2xx without a body reports an error rate of zero.
pub struct HttpHealthProbe {
    client: Client,
    url_template: String,
}

impl HttpHealthProbe {
    pub fn new(url_template: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build health probe client")?;
        Ok(Self {
            client,
            url_template,
        })
    }

    fn url_for(&self, environment: &str) -> String {
        self.url_template.replace("{environment}", environment)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn sample(&self, environment: &str, traffic_percent: u8) -> Result<HealthReport> {
        let response = self
            .client
            .get(self.url_for(environment))
            .query(&[("trafficPercent", traffic_percent)])
            .send()
            .await
            .context("Health endpoint unreachable")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("health endpoint returned {}", status);
        }

        let body = response.text().await.context("Failed to read health body")?;
        if body.trim().is_empty() {
            return Ok(HealthReport { error_rate: 0.0 });
        }
        serde_json::from_str(&body).context("Failed to parse health report")
    }
}

/// Deploy target used when no webhook is configured; only logs
pub struct LoggingDeployTarget;

#[async_trait]
impl DeployTarget for LoggingDeployTarget {
    async fn apply(
        &self,
        environment: &str,
        artifact: &Artifact,
        traffic_percent: u8,
    ) -> Result<()> {
        info!(
            "[dry-run] {} -> {}@{} at {}%",
            environment, artifact.pipeline, artifact.version, traffic_percent
        );
        Ok(())
    }

    async fn revert(&self, environment: &str, version: Option<&str>) -> Result<()> {
        info!(
            "[dry-run] {} reverted to {}",
            environment,
            version.unwrap_or("<nothing>")
        );
        Ok(())
    }
}

/// Health probe used when no health endpoint is configured; always healthy
pub struct StaticHealthProbe;

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn sample(&self, environment: &str, traffic_percent: u8) -> Result<HealthReport> {
        debug!("[dry-run] {} healthy at {}%", environment, traffic_percent);
        Ok(HealthReport { error_rate: 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_template() {
        let probe = HttpHealthProbe::new(
            "http://{environment}.internal/healthz".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(probe.url_for("prod"), "http://prod.internal/healthz");
    }

    #[test]
    fn test_deploy_command_shape() {
        let json = serde_json::to_value(DeployCommand::Revert {
            environment: "prod",
            version: Some("1.2.0"),
        })
        .unwrap();
        assert_eq!(json["action"], "revert");
        assert_eq!(json["version"], "1.2.0");
    }
}
