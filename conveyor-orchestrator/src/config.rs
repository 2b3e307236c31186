//! Orchestrator configuration
//!
//! Every tunable is read from the environment, falling back to defaults
//! suitable for a single-node development setup.

use std::collections::HashMap;
use std::time::Duration;

use conveyor_core::domain::pipeline::CanaryPolicy;

use crate::engine::EngineSettings;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Unset keeps all state in memory.
    pub database_url: Option<String>,

    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Shared secret verifying trigger signatures
    pub trigger_secret: String,

    /// How long an identical trigger is treated as a duplicate
    pub dedup_window: Duration,

    /// Admitted runs that may wait for a worker
    pub queue_capacity: usize,

    /// Runs executed concurrently
    pub worker_count: usize,

    /// Stages executing at once across all runs
    pub max_concurrent_stages: usize,

    /// Stages executing at once within one run
    pub per_run_concurrency: usize,

    /// Deprecated artifact versions kept per pipeline
    pub artifact_retention: usize,

    /// Gate bypass tokens, token -> actor
    pub bypass_tokens: HashMap<String, String>,

    /// Health samples kept per environment
    pub health_history_limit: usize,

    /// Deployment webhook receiving apply/revert commands
    pub deploy_webhook_url: Option<String>,

    /// Health endpoint; `{environment}` is replaced by the environment name
    pub health_url_template: Option<String>,

    /// Timeout for calls to the deployment webhook and health endpoint
    pub collaborator_timeout: Duration,

    pub default_canary: CanaryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            trigger_secret: String::new(),
            dedup_window: Duration::from_secs(300),
            queue_capacity: 64,
            worker_count: 4,
            max_concurrent_stages: 8,
            per_run_concurrency: 4,
            artifact_retention: 5,
            bypass_tokens: HashMap::new(),
            health_history_limit: 50,
            deploy_webhook_url: None,
            health_url_template: None,
            collaborator_timeout: Duration::from_secs(10),
            default_canary: CanaryPolicy::default(),
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Recognized environment variables:
    /// - DATABASE_URL (optional, in-memory state when unset)
    /// - ORCHESTRATOR_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - TRIGGER_SECRET (optional, every trigger is rejected when unset)
    /// - DEDUP_WINDOW_SECS (optional, default: 300)
    /// - QUEUE_CAPACITY (optional, default: 64)
    /// - WORKER_COUNT (optional, default: 4)
    /// - MAX_CONCURRENT_STAGES (optional, default: 8)
    /// - PER_RUN_CONCURRENCY (optional, default: 4)
    /// - ARTIFACT_RETENTION (optional, default: 5)
    /// - GATE_BYPASS_TOKENS (optional, comma-separated actor:token pairs)
    /// - HEALTH_HISTORY_LIMIT (optional, default: 50)
    /// - DEPLOY_WEBHOOK_URL (optional, deployments are only logged when unset)
    /// - HEALTH_URL_TEMPLATE (optional, environments report healthy when unset)
    /// - COLLABORATOR_TIMEOUT_SECS (optional, default: 10)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let number = |key: &str, default: usize| -> anyhow::Result<usize> {
            match non_empty(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, raw)),
                None => Ok(default),
            }
        };
        let seconds = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            number(key, default.as_secs() as usize).map(|s| Duration::from_secs(s as u64))
        };

        let bypass_tokens = match non_empty("GATE_BYPASS_TOKENS") {
            Some(raw) => parse_bypass_tokens(&raw)?,
            None => HashMap::new(),
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            bind_addr: non_empty("ORCHESTRATOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            trigger_secret: lookup("TRIGGER_SECRET").unwrap_or_default(),
            dedup_window: seconds("DEDUP_WINDOW_SECS", defaults.dedup_window)?,
            queue_capacity: number("QUEUE_CAPACITY", defaults.queue_capacity)?,
            worker_count: number("WORKER_COUNT", defaults.worker_count)?,
            max_concurrent_stages: number("MAX_CONCURRENT_STAGES", defaults.max_concurrent_stages)?,
            per_run_concurrency: number("PER_RUN_CONCURRENCY", defaults.per_run_concurrency)?,
            artifact_retention: number("ARTIFACT_RETENTION", defaults.artifact_retention)?,
            bypass_tokens,
            health_history_limit: number("HEALTH_HISTORY_LIMIT", defaults.health_history_limit)?,
            deploy_webhook_url: non_empty("DEPLOY_WEBHOOK_URL"),
            health_url_template: non_empty("HEALTH_URL_TEMPLATE"),
            collaborator_timeout: seconds("COLLABORATOR_TIMEOUT_SECS", defaults.collaborator_timeout)?,
            default_canary: defaults.default_canary,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.max_concurrent_stages == 0 {
            anyhow::bail!("max_concurrent_stages must be greater than 0");
        }

        if self.per_run_concurrency == 0 {
            anyhow::bail!("per_run_concurrency must be greater than 0");
        }

        if self.health_history_limit == 0 {
            anyhow::bail!("health_history_limit must be greater than 0");
        }

        if self.collaborator_timeout.is_zero() {
            anyhow::bail!("collaborator_timeout must be greater than 0");
        }

        for (name, url) in [
            ("deploy_webhook_url", &self.deploy_webhook_url),
            ("health_url_template", &self.health_url_template),
        ] {
            if let Some(url) = url
                && !url.starts_with("http://")
                && !url.starts_with("https://")
            {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
        }

        Ok(())
    }

    /// Engine tunables derived from this configuration
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            trigger_secret: self.trigger_secret.clone(),
            dedup_window: self.dedup_window,
            queue_capacity: self.queue_capacity,
            max_concurrent_stages: self.max_concurrent_stages,
            per_run_concurrency: self.per_run_concurrency,
            artifact_retention: self.artifact_retention,
            bypass_tokens: self.bypass_tokens.clone(),
            health_history_limit: self.health_history_limit,
            default_canary: self.default_canary.clone(),
        }
    }
}

/// Parses `actor:token` pairs separated by commas into a token -> actor map
pub fn parse_bypass_tokens(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((actor, token)) = pair.split_once(':') else {
            anyhow::bail!("invalid bypass token entry '{}', expected actor:token", pair);
        };
        let (actor, token) = (actor.trim(), token.trim());
        if actor.is_empty() || token.is_empty() {
            anyhow::bail!("invalid bypass token entry '{}', expected actor:token", pair);
        }
        if tokens.insert(token.to_string(), actor.to_string()).is_some() {
            anyhow::bail!("bypass token for '{}' is not unique", actor);
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.dedup_window, Duration::from_secs(300));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.artifact_retention, 5);
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_variables() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://conveyor@localhost/conveyor"),
            ("TRIGGER_SECRET", "s3cret"),
            ("DEDUP_WINDOW_SECS", "60"),
            ("QUEUE_CAPACITY", "2"),
            ("GATE_BYPASS_TOKENS", "alice:t1, bob:t2"),
            ("DEPLOY_WEBHOOK_URL", ""),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://conveyor@localhost/conveyor"));
        assert_eq!(config.trigger_secret, "s3cret");
        assert_eq!(config.dedup_window, Duration::from_secs(60));
        assert_eq!(config.queue_capacity, 2);
        assert_eq!(config.bypass_tokens.get("t2").map(String::as_str), Some("bob"));
        assert!(config.deploy_webhook_url.is_none());

        let settings = config.engine_settings();
        assert_eq!(settings.queue_capacity, 2);
        assert_eq!(settings.bypass_tokens.len(), 2);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        assert!(Config::from_lookup(lookup(&[("WORKER_COUNT", "many")])).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.worker_count = 0;
        assert!(config.validate().is_err());
        config.worker_count = 1;

        config.deploy_webhook_url = Some("deploy.internal".to_string());
        assert!(config.validate().is_err());

        config.deploy_webhook_url = Some("https://deploy.internal/hook".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_bypass_tokens() {
        let tokens = parse_bypass_tokens("alice:t1,bob:t2,").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["t1"], "alice");

        assert!(parse_bypass_tokens("alice").is_err());
        assert!(parse_bypass_tokens("alice:").is_err());
        assert!(parse_bypass_tokens("alice:t1,bob:t1").is_err());
    }
}
