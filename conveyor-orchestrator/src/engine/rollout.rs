//! Deployment rollout controller
//!
//! Shifts traffic to a new version in canary steps, watches health for an
//! observation window after each step and rolls back automatically when the
//! failure rate crosses the threshold. At most one rollout runs per
//! environment at any time.

use chrono::Utc;
use conveyor_core::domain::artifact::Artifact;
use conveyor_core::domain::deployment::{
    Deployment, HealthSample, InFlightRollout, RolloutState, failure_rate,
};
use conveyor_core::domain::pipeline::CanaryPolicy;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::artifact::ArtifactManager;
use crate::engine::error::RolloutError;
use crate::engine::target::{DeployTarget, HealthProbe};
use crate::repository::EnvironmentRepository;

/// A request to roll an artifact out to one environment
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub environment: String,
    pub pipeline: String,
    pub run_id: Uuid,
    pub artifact: Artifact,
    pub policy: CanaryPolicy,
}

/// A rollout found mid-flight at startup
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptedRollout {
    pub environment: String,
    /// Run that started the rollout, when still known
    pub run_id: Option<Uuid>,
    pub version: Option<String>,
    /// Whether the environment was reverted; otherwise it stays `RollingBack`
    pub reverted: bool,
}

pub struct RolloutController {
    environments: Arc<dyn EnvironmentRepository>,
    artifacts: Arc<ArtifactManager>,
    target: Arc<dyn DeployTarget>,
    probe: Arc<dyn HealthProbe>,
    /// Environments with a rollout or rollback in flight
    locks: Arc<Mutex<HashSet<String>>>,
    history_limit: usize,
}

/// Exclusive claim on an environment, released on drop
struct EnvironmentLock {
    environment: String,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl Drop for EnvironmentLock {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&self.environment);
    }
}

impl RolloutController {
    pub fn new(
        environments: Arc<dyn EnvironmentRepository>,
        artifacts: Arc<ArtifactManager>,
        target: Arc<dyn DeployTarget>,
        probe: Arc<dyn HealthProbe>,
        history_limit: usize,
    ) -> Self {
        Self {
            environments,
            artifacts,
            target,
            probe,
            locks: Arc::new(Mutex::new(HashSet::new())),
            history_limit,
        }
    }

    fn try_lock(&self, environment: &str) -> Option<EnvironmentLock> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if !locks.insert(environment.to_string()) {
            return None;
        }
        Some(EnvironmentLock {
            environment: environment.to_string(),
            locks: self.locks.clone(),
        })
    }

    fn busy(environment: &str) -> RolloutError {
        RolloutError::Rejected {
            environment: environment.to_string(),
            reason: "already has a rollout in flight".to_string(),
        }
    }

    async fn persist(&self, deployment: &mut Deployment) -> Result<(), RolloutError> {
        deployment.updated_at = Utc::now();
        self.environments.save(deployment).await?;
        Ok(())
    }

    pub async fn get(&self, environment: &str) -> Result<Deployment, RolloutError> {
        self.environments
            .find(environment)
            .await?
            .ok_or_else(|| RolloutError::EnvironmentNotFound(environment.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Deployment>, RolloutError> {
        Ok(self.environments.list().await?)
    }

    /// Rolls the artifact out step by step.
    ///
    /// Returns the `Healthy` deployment on success. On a health failure,
    /// apply failure or cancellation the environment is reverted and the
    /// cause is returned; if the revert itself fails the environment stays
    /// `RollingBack` and [`RolloutError::RollbackFailed`] is returned.
    pub async fn deploy(
        &self,
        request: RolloutRequest,
        cancel: CancellationToken,
    ) -> Result<Deployment, RolloutError> {
        let environment = request.environment.as_str();
        let Some(_lock) = self.try_lock(environment) else {
            warn!(
                "Rejected rollout of {} to {}: rollout in flight",
                request.artifact.version, environment
            );
            return Err(Self::busy(environment));
        };

        let mut deployment = self
            .environments
            .find(environment)
            .await?
            .unwrap_or_else(|| Deployment::new(environment));

        if !deployment.state.accepts_rollout() {
            return Err(RolloutError::Rejected {
                environment: environment.to_string(),
                reason: format!("is {}", deployment.state),
            });
        }

        deployment.state = RolloutState::RolloutInProgress;
        deployment.pipeline = Some(request.pipeline.clone());
        deployment.in_flight = Some(InFlightRollout {
            version: request.artifact.version.clone(),
            pipeline: request.pipeline.clone(),
            run_id: request.run_id,
            step: 0,
            traffic_percent: 0,
            started_at: Utc::now(),
        });
        self.persist(&mut deployment).await?;

        info!(
            "Rolling out {}@{} to {} in steps {:?}",
            request.pipeline, request.artifact.version, environment, request.policy.steps
        );

        match self.advance(&request, &mut deployment, &cancel).await {
            Ok(()) => {
                deployment.previous_version = deployment.current_version.take();
                deployment.current_version = Some(request.artifact.version.clone());
                deployment.state = RolloutState::Healthy;
                deployment.in_flight = None;
                self.persist(&mut deployment).await?;
                info!(
                    "Rollout of {} to {} completed, environment healthy",
                    request.artifact.version, environment
                );
                Ok(deployment)
            }
            Err(cause) => {
                warn!("Rollout to {} failed: {}", environment, cause);
                self.settle_interrupted(&mut deployment).await?;
                Err(cause)
            }
        }
    }

    async fn advance(
        &self,
        request: &RolloutRequest,
        deployment: &mut Deployment,
        cancel: &CancellationToken,
    ) -> Result<(), RolloutError> {
        let environment = request.environment.as_str();

        for (step, &traffic_percent) in request.policy.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(RolloutError::Cancelled {
                    environment: environment.to_string(),
                });
            }

            if let Some(in_flight) = deployment.in_flight.as_mut() {
                in_flight.step = step;
                in_flight.traffic_percent = traffic_percent;
            }
            self.persist(deployment).await?;

            info!(
                "Rollout {} step {}/{}: {}% traffic",
                environment,
                step + 1,
                request.policy.steps.len(),
                traffic_percent
            );
            self.target
                .apply(environment, &request.artifact, traffic_percent)
                .await
                .map_err(|e| RolloutError::ApplyFailed {
                    environment: environment.to_string(),
                    version: request.artifact.version.clone(),
                    message: format!("{:#}", e),
                })?;

            let samples = self
                .observe(environment, &request.policy, traffic_percent, deployment, cancel)
                .await?;
            let rate = failure_rate(&samples);
            debug!(
                "Rollout {} at {}%: failure rate {:.3} over {} samples",
                environment,
                traffic_percent,
                rate,
                samples.len()
            );

            if rate > request.policy.failure_rate_threshold {
                return Err(RolloutError::HealthCheckFailed {
                    environment: environment.to_string(),
                    traffic_percent,
                    failure_rate: rate,
                    threshold: request.policy.failure_rate_threshold,
                });
            }
        }

        Ok(())
    }

    /// Samples health once per poll interval for one observation window
    async fn observe(
        &self,
        environment: &str,
        policy: &CanaryPolicy,
        traffic_percent: u8,
        deployment: &mut Deployment,
        cancel: &CancellationToken,
    ) -> Result<Vec<HealthSample>, RolloutError> {
        let poll = policy.poll_interval_seconds.max(1);
        let count = (policy.observation_window_seconds / poll).max(1);
        let mut samples = Vec::with_capacity(count as usize);

        for _ in 0..count {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(poll)) => {}
                _ = cancel.cancelled() => {
                    return Err(RolloutError::Cancelled {
                        environment: environment.to_string(),
                    });
                }
            }

            let sample = match self.probe.sample(environment, traffic_percent).await {
                Ok(report) => HealthSample {
                    at: Utc::now(),
                    traffic_percent,
                    error_rate: report.error_rate.clamp(0.0, 1.0),
                    probe_success: true,
                },
                Err(e) => {
                    debug!("Health probe for {} failed: {:#}", environment, e);
                    HealthSample {
                        at: Utc::now(),
                        traffic_percent,
                        error_rate: 0.0,
                        probe_success: false,
                    }
                }
            };
            deployment.record_health(sample.clone(), self.history_limit);
            samples.push(sample);
        }

        self.persist(deployment).await?;
        Ok(samples)
    }

    /// Reverts an interrupted rollout to the version that was serving
    /// before it and marks the in-flight artifact rolled back.
    ///
    /// On success the environment ends `Idle`; when the revert fails it
    /// stays `RollingBack` for an operator.
    async fn settle_interrupted(&self, deployment: &mut Deployment) -> Result<(), RolloutError> {
        let environment = deployment.environment.clone();
        deployment.state = RolloutState::RollingBack;
        self.persist(deployment).await?;

        let restore = deployment.current_version.clone();
        if let Err(e) = self.target.revert(&environment, restore.as_deref()).await {
            error!(
                "Rollback of {} failed, environment left RollingBack: {:#}",
                environment, e
            );
            return Err(RolloutError::RollbackFailed {
                environment,
                message: format!("{:#}", e),
            });
        }

        let in_flight = deployment.in_flight.take();
        deployment.state = RolloutState::Idle;
        self.persist(deployment).await?;
        warn!(
            "Rolled back {} to {}",
            environment,
            restore.as_deref().unwrap_or("<nothing>")
        );

        if let Some(in_flight) = in_flight {
            if let Err(e) = self
                .artifacts
                .mark_rolled_back(&in_flight.pipeline, &in_flight.version)
                .await
            {
                error!(
                    "Failed to mark {}@{} rolled back: {}",
                    in_flight.pipeline, in_flight.version, e
                );
            }
        }
        Ok(())
    }

    /// Operator-initiated rollback.
    ///
    /// An environment stuck mid-rollout or in `RollingBack` is reverted to
    /// its current version. A settled environment is reverted to its
    /// previous version and the current artifact is marked rolled back.
    pub async fn force_rollback(
        &self,
        environment: &str,
        reason: Option<&str>,
    ) -> Result<Deployment, RolloutError> {
        let Some(_lock) = self.try_lock(environment) else {
            return Err(Self::busy(environment));
        };
        let mut deployment = self.get(environment).await?;

        info!(
            "Forced rollback of {} requested ({})",
            environment,
            reason.unwrap_or("no reason given")
        );

        if deployment.state.is_transient() {
            self.settle_interrupted(&mut deployment).await?;
            return Ok(deployment);
        }

        let Some(previous) = deployment.previous_version.clone() else {
            return Err(RolloutError::NothingToRollBack(environment.to_string()));
        };
        self.replace_current(&mut deployment, Some(previous)).await?;
        Ok(deployment)
    }

    /// Takes `version` back out of an environment it was just released to,
    /// restoring the version it replaced. Nothing happens when another
    /// version is serving by now.
    pub async fn withdraw(
        &self,
        environment: &str,
        version: &str,
    ) -> Result<Deployment, RolloutError> {
        let Some(_lock) = self.try_lock(environment) else {
            return Err(Self::busy(environment));
        };
        let mut deployment = self.get(environment).await?;
        if deployment.current_version.as_deref() != Some(version) {
            debug!("{} no longer serves {}, nothing to withdraw", environment, version);
            return Ok(deployment);
        }

        warn!("Withdrawing {} from {}", version, environment);
        let restore = deployment.previous_version.clone();
        self.replace_current(&mut deployment, restore).await?;
        Ok(deployment)
    }

    /// Reverts a settled environment to `restore` and marks the version it
    /// replaces rolled back
    async fn replace_current(
        &self,
        deployment: &mut Deployment,
        restore: Option<String>,
    ) -> Result<(), RolloutError> {
        let environment = deployment.environment.clone();
        deployment.state = RolloutState::RollingBack;
        self.persist(deployment).await?;

        if let Err(e) = self.target.revert(&environment, restore.as_deref()).await {
            error!("Rollback of {} failed: {:#}", environment, e);
            return Err(RolloutError::RollbackFailed {
                environment,
                message: format!("{:#}", e),
            });
        }

        let replaced = std::mem::replace(&mut deployment.current_version, restore);
        deployment.previous_version = None;
        deployment.state = RolloutState::Idle;
        self.persist(deployment).await?;

        if let (Some(pipeline), Some(version)) = (deployment.pipeline.clone(), replaced) {
            if let Err(e) = self.artifacts.mark_rolled_back(&pipeline, &version).await {
                error!("Failed to mark {}@{} rolled back: {}", pipeline, version, e);
            }
        }
        Ok(())
    }

    /// Fails safe every rollout interrupted by a restart
    pub async fn recover(&self) -> Result<Vec<InterruptedRollout>, RolloutError> {
        let mut interrupted = Vec::new();
        for mut deployment in self.environments.list().await? {
            if !deployment.state.is_transient() {
                continue;
            }
            let Some(_lock) = self.try_lock(&deployment.environment) else {
                continue;
            };

            warn!(
                "Environment {} was {} at startup, rolling back",
                deployment.environment, deployment.state
            );
            let in_flight = deployment.in_flight.clone();
            let reverted = match self.settle_interrupted(&mut deployment).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Recovery of {} failed: {}", deployment.environment, e);
                    false
                }
            };
            interrupted.push(InterruptedRollout {
                environment: deployment.environment.clone(),
                run_id: in_flight.as_ref().map(|f| f.run_id),
                version: in_flight.map(|f| f.version),
                reverted,
            });
        }
        Ok(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::artifact::{ArtifactHandle, ArtifactState};

    use crate::engine::testing::{RecordingTarget, ScriptedProbe, TargetCall};
    use crate::repository::artifact::InMemoryArtifactRepository;
    use crate::repository::environment::InMemoryEnvironmentRepository;

    struct Fixture {
        controller: Arc<RolloutController>,
        artifacts: Arc<ArtifactManager>,
        target: Arc<RecordingTarget>,
        probe: Arc<ScriptedProbe>,
    }

    fn fixture(probe: ScriptedProbe) -> Fixture {
        let artifacts = Arc::new(ArtifactManager::new(
            Arc::new(InMemoryArtifactRepository::default()),
            5,
        ));
        let target = Arc::new(RecordingTarget::default());
        let probe = Arc::new(probe);
        let controller = Arc::new(RolloutController::new(
            Arc::new(InMemoryEnvironmentRepository::default()),
            artifacts.clone(),
            target.clone(),
            probe.clone(),
            50,
        ));
        Fixture {
            controller,
            artifacts,
            target,
            probe,
        }
    }

    async fn request(fixture: &Fixture, version: &str) -> RolloutRequest {
        let run_id = Uuid::new_v4();
        let artifact = fixture
            .artifacts
            .register(
                "api",
                run_id,
                &ArtifactHandle {
                    version: version.to_string(),
                    content_ref: format!("sha256:{}", version),
                },
            )
            .await
            .unwrap();
        RolloutRequest {
            environment: "prod".to_string(),
            pipeline: "api".to_string(),
            run_id,
            artifact,
            policy: CanaryPolicy::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_rollout_walks_all_steps() {
        let fx = fixture(ScriptedProbe::default());
        let req = request(&fx, "1.0").await;

        let deployment = fx
            .controller
            .deploy(req, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(deployment.state, RolloutState::Healthy);
        assert_eq!(deployment.current_version.as_deref(), Some("1.0"));
        assert!(deployment.in_flight.is_none());
        // 60s window / 5s poll = 12 samples per step
        assert_eq!(fx.probe.sample_count(), 36);

        let applied: Vec<u8> = fx
            .target
            .calls("prod")
            .into_iter()
            .filter_map(|c| match c {
                TargetCall::Apply {
                    traffic_percent, ..
                } => Some(traffic_percent),
                _ => None,
            })
            .collect();
        assert_eq!(applied, vec![10, 50, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_step_rolls_back() {
        let fx = fixture(ScriptedProbe::default());

        let first = request(&fx, "1.0").await;
        let mut healthy = fx.controller.deploy(first, CancellationToken::new()).await.unwrap();
        assert_eq!(healthy.current_version.as_deref(), Some("1.0"));

        // Healthy at 10%, 12% errors at 50%
        fx.probe.set_error_rate(50, 0.12);

        let second = request(&fx, "2.0").await;
        let err = fx
            .controller
            .deploy(second, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RolloutError::HealthCheckFailed {
                traffic_percent,
                failure_rate,
                ..
            } => {
                assert_eq!(traffic_percent, 50);
                assert!((failure_rate - 0.12).abs() < 1e-9);
            }
            other => panic!("unexpected error: {}", other),
        }

        healthy = fx.controller.get("prod").await.unwrap();
        assert_eq!(healthy.state, RolloutState::Idle);
        assert_eq!(healthy.current_version.as_deref(), Some("1.0"));
        assert!(healthy.in_flight.is_none());

        let calls = fx.target.calls("prod");
        assert_eq!(
            calls.last(),
            Some(&TargetCall::Revert {
                version: Some("1.0".to_string())
            })
        );
        // Never reached 100%
        assert!(!calls.iter().any(|c| matches!(
            c,
            TargetCall::Apply { version, traffic_percent: 100 } if version == "2.0"
        )));

        let rolled_back = fx.artifacts.find("api", "2.0").await.unwrap().unwrap();
        assert_eq!(rolled_back.state, ArtifactState::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_probe_counts_as_failure() {
        let fx = fixture(ScriptedProbe::default().unreachable());
        let req = request(&fx, "1.0").await;

        let err = fx
            .controller
            .deploy(req, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::HealthCheckFailed { traffic_percent: 10, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_revert_leaves_rolling_back() {
        let fx = fixture(ScriptedProbe::default().error_rate_at(10, 1.0));
        fx.target.fail_revert.store(true, std::sync::atomic::Ordering::SeqCst);
        let req = request(&fx, "1.0").await;

        let err = fx
            .controller
            .deploy(req, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::RollbackFailed { .. }));
        assert_eq!(
            fx.controller.get("prod").await.unwrap().state,
            RolloutState::RollingBack
        );

        // A new rollout is refused until an operator intervenes
        let next = request(&fx, "1.1").await;
        assert!(matches!(
            fx.controller.deploy(next, CancellationToken::new()).await,
            Err(RolloutError::Rejected { .. })
        ));

        fx.target.fail_revert.store(false, std::sync::atomic::Ordering::SeqCst);
        let settled = fx.controller.force_rollback("prod", Some("manual")).await.unwrap();
        assert_eq!(settled.state, RolloutState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rollouts_are_exclusive() {
        let fx = fixture(ScriptedProbe::default());
        let mut requests = Vec::new();
        for i in 0..5 {
            requests.push(request(&fx, &format!("1.{}", i)).await);
        }

        let results = futures::future::join_all(requests.into_iter().map(|req| {
            let controller = fx.controller.clone();
            async move { controller.deploy(req, CancellationToken::new()).await }
        }))
        .await;

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(RolloutError::Rejected { .. })))
            .count();
        assert_eq!(succeeded, 1);
        assert_eq!(rejected, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_rolls_back() {
        let fx = fixture(ScriptedProbe::default());
        let req = request(&fx, "1.0").await;
        let cancel = CancellationToken::new();

        let controller = fx.controller.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { controller.deploy(req, token).await });

        tokio::time::sleep(Duration::from_secs(7)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RolloutError::Cancelled { .. })));
        assert_eq!(fx.controller.get("prod").await.unwrap().state, RolloutState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_rollback_restores_previous() {
        let fx = fixture(ScriptedProbe::default());
        let first = request(&fx, "1.0").await;
        fx.controller.deploy(first, CancellationToken::new()).await.unwrap();
        let second = request(&fx, "2.0").await;
        fx.controller.deploy(second, CancellationToken::new()).await.unwrap();

        let deployment = fx.controller.force_rollback("prod", None).await.unwrap();
        assert_eq!(deployment.current_version.as_deref(), Some("1.0"));
        assert_eq!(deployment.previous_version, None);
        assert_eq!(deployment.state, RolloutState::Idle);

        assert!(matches!(
            fx.controller.force_rollback("prod", None).await,
            Err(RolloutError::NothingToRollBack(_))
        ));
        assert!(matches!(
            fx.controller.force_rollback("staging", None).await,
            Err(RolloutError::EnvironmentNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_restores_replaced_version() {
        let fx = fixture(ScriptedProbe::default());
        let first = request(&fx, "1.0").await;
        fx.controller.deploy(first, CancellationToken::new()).await.unwrap();
        let second = request(&fx, "2.0").await;
        fx.controller.deploy(second, CancellationToken::new()).await.unwrap();

        // Another version serving: untouched
        let untouched = fx.controller.withdraw("prod", "1.0").await.unwrap();
        assert_eq!(untouched.current_version.as_deref(), Some("2.0"));
        assert_eq!(untouched.state, RolloutState::Healthy);

        let deployment = fx.controller.withdraw("prod", "2.0").await.unwrap();
        assert_eq!(deployment.current_version.as_deref(), Some("1.0"));
        assert_eq!(deployment.state, RolloutState::Idle);
        assert_eq!(
            fx.target.calls("prod").last(),
            Some(&TargetCall::Revert {
                version: Some("1.0".to_string())
            })
        );
        assert_eq!(
            fx.artifacts.find("api", "2.0").await.unwrap().unwrap().state,
            ArtifactState::RolledBack
        );
    }

    #[tokio::test]
    async fn test_recover_interrupted_rollout() {
        let fx = fixture(ScriptedProbe::default());
        let req = request(&fx, "3.0").await;

        let mut stuck = Deployment::new("prod");
        stuck.state = RolloutState::RolloutInProgress;
        stuck.current_version = Some("2.0".to_string());
        stuck.pipeline = Some("api".to_string());
        stuck.in_flight = Some(InFlightRollout {
            version: "3.0".to_string(),
            pipeline: "api".to_string(),
            run_id: req.run_id,
            step: 1,
            traffic_percent: 50,
            started_at: Utc::now(),
        });
        fx.controller.environments.save(&stuck).await.unwrap();

        let interrupted = fx.controller.recover().await.unwrap();
        assert_eq!(
            interrupted,
            vec![InterruptedRollout {
                environment: "prod".to_string(),
                run_id: Some(req.run_id),
                version: Some("3.0".to_string()),
                reverted: true,
            }]
        );

        let deployment = fx.controller.get("prod").await.unwrap();
        assert_eq!(deployment.state, RolloutState::Idle);
        assert_eq!(deployment.current_version.as_deref(), Some("2.0"));
        assert_eq!(
            fx.artifacts.find("api", "3.0").await.unwrap().unwrap().state,
            ArtifactState::RolledBack
        );
    }
}
