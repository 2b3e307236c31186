//! Scripted collaborators for engine tests

use anyhow::Result;
use async_trait::async_trait;
use conveyor_core::domain::artifact::{Artifact, ArtifactHandle};
use conveyor_core::domain::gate::MetricsPayload;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::adapter::{StageAdapter, StageContext, StageOutput};
use crate::engine::error::StageError;
use crate::engine::target::{DeployTarget, HealthProbe, HealthReport};

/// What a scripted stage does on one attempt
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(StageOutput),
    Fail(String),
    /// Sleeps, then succeeds
    Delay(Duration),
    /// Waits until cancelled
    Hang,
}

impl Step {
    pub fn ok() -> Self {
        Step::Succeed(StageOutput::default())
    }

    pub fn metrics(pairs: &[(&str, f64)]) -> Self {
        let metrics: MetricsPayload = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        Step::Succeed(StageOutput {
            metrics: Some(metrics),
            ..StageOutput::default()
        })
    }

    pub fn artifact(version: &str, content_ref: &str) -> Self {
        Step::Succeed(StageOutput {
            artifact: Some(ArtifactHandle {
                version: version.to_string(),
                content_ref: content_ref.to_string(),
            }),
            ..StageOutput::default()
        })
    }
}

/// Adapter replaying per-stage scripts. Stages without a script succeed;
/// the last step of a script repeats once it is exhausted.
#[derive(Default)]
pub struct ScriptedAdapter {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    attempts: Mutex<HashMap<String, u32>>,
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn script(self, stage: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(stage.to_string(), steps.into());
        self
    }

    pub fn attempts(&self, stage: &str) -> u32 {
        self.attempts.lock().unwrap().get(stage).copied().unwrap_or(0)
    }

    /// Stage ids in the order their first attempt started
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Highest number of attempts running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, stage: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(stage) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) => steps.front().cloned().unwrap_or_else(Step::ok),
            None => Step::ok(),
        }
    }
}

#[async_trait]
impl StageAdapter for ScriptedAdapter {
    async fn run(
        &self,
        ctx: &StageContext,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(ctx.stage.id.clone()).or_default();
            if *count == 0 {
                self.started.lock().unwrap().push(ctx.stage.id.clone());
            }
            *count += 1;
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let step = self.next_step(&ctx.stage.id);
        let result = match step {
            Step::Succeed(output) => Ok(output),
            Step::Fail(message) => Err(StageError::Execution(message)),
            Step::Delay(duration) => tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(StageOutput::default()),
                _ = cancel.cancelled() => Err(StageError::Cancelled),
            },
            Step::Hang => {
                cancel.cancelled().await;
                Err(StageError::Cancelled)
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetCall {
    Apply { version: String, traffic_percent: u8 },
    Revert { version: Option<String> },
}

/// Deploy target recording every call
#[derive(Default)]
pub struct RecordingTarget {
    calls: Mutex<Vec<(String, TargetCall)>>,
    pub fail_apply: AtomicBool,
    pub fail_revert: AtomicBool,
}

impl RecordingTarget {
    pub fn calls(&self, environment: &str) -> Vec<TargetCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(env, _)| env == environment)
            .map(|(_, call)| call.clone())
            .collect()
    }
}

#[async_trait]
impl DeployTarget for RecordingTarget {
    async fn apply(
        &self,
        environment: &str,
        artifact: &Artifact,
        traffic_percent: u8,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((
            environment.to_string(),
            TargetCall::Apply {
                version: artifact.version.clone(),
                traffic_percent,
            },
        ));
        if self.fail_apply.load(Ordering::SeqCst) {
            anyhow::bail!("apply refused");
        }
        Ok(())
    }

    async fn revert(&self, environment: &str, version: Option<&str>) -> Result<()> {
        self.calls.lock().unwrap().push((
            environment.to_string(),
            TargetCall::Revert {
                version: version.map(str::to_string),
            },
        ));
        if self.fail_revert.load(Ordering::SeqCst) {
            anyhow::bail!("revert refused");
        }
        Ok(())
    }
}

/// Probe reporting a fixed error rate per traffic percentage (0 by default)
#[derive(Default)]
pub struct ScriptedProbe {
    error_rates: Mutex<HashMap<u8, f64>>,
    unreachable: AtomicBool,
    samples: AtomicUsize,
}

impl ScriptedProbe {
    pub fn error_rate_at(self, traffic_percent: u8, error_rate: f64) -> Self {
        self.set_error_rate(traffic_percent, error_rate);
        self
    }

    pub fn set_error_rate(&self, traffic_percent: u8, error_rate: f64) {
        self.error_rates
            .lock()
            .unwrap()
            .insert(traffic_percent, error_rate);
    }

    pub fn unreachable(self) -> Self {
        self.unreachable.store(true, Ordering::SeqCst);
        self
    }

    pub fn sample_count(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn sample(&self, _environment: &str, traffic_percent: u8) -> Result<HealthReport> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let error_rate = self
            .error_rates
            .lock()
            .unwrap()
            .get(&traffic_percent)
            .copied()
            .unwrap_or(0.0);
        Ok(HealthReport { error_rate })
    }
}
