//! Deployment domain model
//!
//! Per-environment rollout state. The record is persisted on every state
//! change so a restarted orchestrator can fail an interrupted rollout safe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Rollout state of one target environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub environment: String,
    pub state: RolloutState,
    /// Currently released version serving traffic
    pub current_version: Option<String>,
    /// Version released before `current_version`, target of a manual rollback
    pub previous_version: Option<String>,
    /// Pipeline whose artifacts are deployed here
    pub pipeline: Option<String>,
    pub in_flight: Option<InFlightRollout>,
    pub health_history: VecDeque<HealthSample>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            state: RolloutState::Idle,
            current_version: None,
            previous_version: None,
            pipeline: None,
            in_flight: None,
            health_history: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }

    /// Appends a health sample, dropping the oldest beyond `limit`
    pub fn record_health(&mut self, sample: HealthSample, limit: usize) {
        self.health_history.push_back(sample);
        while self.health_history.len() > limit {
            self.health_history.pop_front();
        }
    }
}

/// Rollout state machine of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutState {
    Idle,
    RolloutInProgress,
    Healthy,
    RollingBack,
}

impl RolloutState {
    /// Whether a new rollout may start from this state
    pub fn accepts_rollout(&self) -> bool {
        matches!(self, RolloutState::Idle | RolloutState::Healthy)
    }

    /// Whether a rollout was interrupted in this state
    pub fn is_transient(&self) -> bool {
        matches!(self, RolloutState::RolloutInProgress | RolloutState::RollingBack)
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutState::Idle => write!(f, "Idle"),
            RolloutState::RolloutInProgress => write!(f, "RolloutInProgress"),
            RolloutState::Healthy => write!(f, "Healthy"),
            RolloutState::RollingBack => write!(f, "RollingBack"),
        }
    }
}

impl std::str::FromStr for RolloutState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(RolloutState::Idle),
            "RolloutInProgress" => Ok(RolloutState::RolloutInProgress),
            "Healthy" => Ok(RolloutState::Healthy),
            "RollingBack" => Ok(RolloutState::RollingBack),
            other => Err(format!("unknown rollout state '{}'", other)),
        }
    }
}

/// The rollout currently applying a new version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightRollout {
    pub version: String,
    pub pipeline: String,
    pub run_id: Uuid,
    /// Index into the canary step list
    pub step: usize,
    pub traffic_percent: u8,
    pub started_at: DateTime<Utc>,
}

/// One observation of an environment's health signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub traffic_percent: u8,
    /// Fraction of failing requests (0.0 - 1.0)
    pub error_rate: f64,
    pub probe_success: bool,
}

/// Observed failure rate of a window of samples.
///
/// The larger of the mean reported error rate and the fraction of failed
/// probes. An empty window has a failure rate of zero.
pub fn failure_rate(samples: &[HealthSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean_error = samples.iter().map(|s| s.error_rate).sum::<f64>() / n;
    let probe_failures = samples.iter().filter(|s| !s.probe_success).count() as f64 / n;
    mean_error.max(probe_failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(error_rate: f64, probe_success: bool) -> HealthSample {
        HealthSample {
            at: Utc::now(),
            traffic_percent: 10,
            error_rate,
            probe_success,
        }
    }

    #[test]
    fn test_failure_rate() {
        assert_eq!(failure_rate(&[]), 0.0);
        let samples = vec![sample(0.1, true), sample(0.3, true)];
        assert!((failure_rate(&samples) - 0.2).abs() < 1e-9);

        let probes = vec![sample(0.0, false), sample(0.0, true)];
        assert!((failure_rate(&probes) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_health_history_is_bounded() {
        let mut deployment = Deployment::new("prod");
        for _ in 0..5 {
            deployment.record_health(sample(0.0, true), 3);
        }
        assert_eq!(deployment.health_history.len(), 3);
    }

    #[test]
    fn test_state_acceptance() {
        assert!(RolloutState::Idle.accepts_rollout());
        assert!(RolloutState::Healthy.accepts_rollout());
        assert!(!RolloutState::RolloutInProgress.accepts_rollout());
        assert!(RolloutState::RollingBack.is_transient());
        assert_eq!(
            "RollingBack".parse::<RolloutState>().unwrap(),
            RolloutState::RollingBack
        );
    }
}
