//! Pipeline engine
//!
//! Wires trigger admission, the stage scheduler, the quality gate, the
//! artifact lifecycle and the rollout controller into one [`Orchestrator`].
//! Admitted runs flow through the [`trigger::RunQueue`] to a pool of
//! workers, each driving one run at a time through the [`Scheduler`].

pub mod adapter;
pub mod artifact;
pub mod error;
pub mod gate;
pub mod recovery;
pub mod rollout;
pub mod scheduler;
pub mod target;
pub mod trigger;

#[cfg(test)]
pub mod testing;

use chrono::Utc;
use conveyor_core::domain::pipeline::CanaryPolicy;
use conveyor_core::domain::run::{
    FailureKind, Run, RunEventKind, RunStatus, StageResult, StageStatus,
};
use conveyor_core::domain::trigger::{LaneKey, TriggerNotification};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::repository::Repositories;
use adapter::AdapterRegistry;
use artifact::ArtifactManager;
use error::{EngineError, GateError, TriggerError};
use gate::GateKeeper;
use rollout::RolloutController;
use scheduler::Scheduler;
use target::{DeployTarget, HealthProbe};
use trigger::{Deduplicator, RunQueue};

/// Tunables of the engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Shared secret for trigger signatures; empty rejects every trigger
    pub trigger_secret: String,
    pub dedup_window: Duration,
    pub queue_capacity: usize,
    pub max_concurrent_stages: usize,
    pub per_run_concurrency: usize,
    pub artifact_retention: usize,
    /// token -> actor
    pub bypass_tokens: HashMap<String, String>,
    pub health_history_limit: usize,
    pub default_canary: CanaryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            trigger_secret: String::new(),
            dedup_window: Duration::from_secs(300),
            queue_capacity: 64,
            max_concurrent_stages: 8,
            per_run_concurrency: 4,
            artifact_retention: 5,
            bypass_tokens: HashMap::new(),
            health_history_limit: 50,
            default_canary: CanaryPolicy::default(),
        }
    }
}

pub struct Orchestrator {
    repos: Repositories,
    scheduler: Arc<Scheduler>,
    queue: RunQueue,
    dedup: Deduplicator,
    gate: GateKeeper,
    artifacts: Arc<ArtifactManager>,
    rollout: Arc<RolloutController>,
    trigger_secret: String,
}

impl Orchestrator {
    pub fn new(
        repos: Repositories,
        settings: EngineSettings,
        adapters: AdapterRegistry,
        target: Arc<dyn DeployTarget>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let artifacts = Arc::new(ArtifactManager::new(
            repos.artifacts.clone(),
            settings.artifact_retention,
        ));
        let rollout = Arc::new(RolloutController::new(
            repos.environments.clone(),
            artifacts.clone(),
            target,
            probe,
            settings.health_history_limit,
        ));
        let scheduler = Arc::new(Scheduler::new(
            repos.runs.clone(),
            adapters,
            artifacts.clone(),
            rollout.clone(),
            settings.max_concurrent_stages,
            settings.per_run_concurrency,
            settings.default_canary,
        ));

        Self {
            scheduler,
            queue: RunQueue::new(settings.queue_capacity),
            dedup: Deduplicator::new(settings.dedup_window),
            gate: GateKeeper::new(settings.bypass_tokens, repos.gate_audit.clone()),
            artifacts,
            rollout,
            trigger_secret: settings.trigger_secret,
            repos,
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn rollout(&self) -> &RolloutController {
        &self.rollout
    }

    pub fn gate(&self) -> &GateKeeper {
        &self.gate
    }

    /// Validates a change notification and admits a new run for it.
    ///
    /// Returns the id of the created run. A trigger already seen within
    /// the dedup window fails with [`TriggerError::Duplicate`] carrying the
    /// existing run id.
    pub async fn ingest(&self, notification: &TriggerNotification) -> Result<Uuid, TriggerError> {
        if notification.repository.trim().is_empty()
            || notification.branch.trim().is_empty()
            || notification.change_ref.trim().is_empty()
        {
            return Err(TriggerError::Validation(
                "repository, branch and changeRef are required".to_string(),
            ));
        }
        if !notification.verify(&self.trigger_secret) {
            warn!(
                "Rejected trigger for {}@{}: invalid signature",
                notification.repository, notification.branch
            );
            return Err(TriggerError::InvalidSignature);
        }

        let definition = self
            .repos
            .pipelines
            .find_by_repository(&notification.repository)
            .await?
            .ok_or_else(|| TriggerError::UnknownRepository(notification.repository.clone()))?;

        let context = notification.context();
        let run = Run::new(definition, context.clone());

        if let Err(existing) = self.dedup.claim(&context, run.id) {
            info!(
                "Duplicate trigger for {}@{} ({}), run {} already exists",
                context.repository, context.branch, context.change_ref, existing
            );
            return Err(TriggerError::Duplicate(existing));
        }
        if let Err(e) = self.queue.try_reserve() {
            warn!("Admission queue full, rejecting trigger for {}", context.repository);
            self.dedup.release(&context, run.id);
            return Err(e);
        }

        let created = async {
            self.repos.runs.insert(&run).await?;
            self.repos
                .runs
                .append_event(run.id, RunEventKind::Created)
                .await
        }
        .await;
        if let Err(e) = created {
            self.dedup.release(&context, run.id);
            self.queue.cancel_reservation();
            return Err(e.into());
        }

        self.scheduler.register(run.id);
        self.queue.admit(run.id, LaneKey::from(&context));
        info!(
            "Admitted run {} of pipeline {} for {}@{} ({})",
            run.id, run.pipeline, context.repository, context.branch, context.change_ref
        );

        Ok(run.id)
    }

    /// Requests cancellation of a run
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run, EngineError> {
        self.scheduler.cancel(run_id).await
    }

    /// Overrides a failing gate verdict with a bypass token.
    ///
    /// The bypass is audited. A run that failed only because of the gate is
    /// re-opened: its gate-blocked stages return to pending and the run is
    /// scheduled again.
    pub async fn override_gate(
        &self,
        run_id: Uuid,
        token: &str,
        reason: Option<String>,
    ) -> Result<Run, GateError> {
        let mut run = self
            .repos
            .runs
            .find(run_id)
            .await?
            .ok_or(GateError::RunNotFound(run_id))?;
        if !run.status.is_terminal() {
            return Err(GateError::RunActive(run_id));
        }

        let reopen = run.failed_by_gate();
        let bypass = self.gate.bypass(&run, token, reason).await?;
        let actor = bypass.actor.clone();
        if let Some(evaluation) = run.gate.as_mut() {
            evaluation.bypass = Some(bypass);
        }
        self.repos.runs.save(&run).await?;
        self.repos
            .runs
            .append_event(run.id, RunEventKind::GateOverridden { actor: actor.clone() })
            .await?;

        if !reopen {
            return Ok(run);
        }

        let mut reset = Vec::new();
        for (id, result) in run.stages.iter_mut() {
            let gate_blocked = match result.status {
                StageStatus::Failed => result
                    .failure
                    .as_ref()
                    .is_some_and(|f| f.kind == FailureKind::QualityGate),
                StageStatus::Skipped => true,
                _ => false,
            };
            if gate_blocked {
                *result = StageResult::pending();
                reset.push(id.clone());
            }
        }
        run.status = RunStatus::Running;
        run.completed_at = None;
        self.repos.runs.save(&run).await?;

        for stage in reset {
            self.repos
                .runs
                .append_event(
                    run.id,
                    RunEventKind::StageChanged {
                        stage,
                        status: StageStatus::Pending,
                        attempt: 0,
                    },
                )
                .await?;
        }
        self.repos
            .runs
            .append_event(run.id, RunEventKind::Resumed)
            .await?;

        self.scheduler.register(run.id);
        self.queue.readmit(run.id, LaneKey::from(&run.trigger));
        info!("Run {} re-opened after gate override by {}", run.id, actor);

        Ok(run)
    }

    /// Starts `count` workers draining the admission queue
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move { orchestrator.work(worker).await })
            })
            .collect()
    }

    async fn work(&self, worker: usize) {
        debug!("Worker {} started", worker);
        while let Some(admission) = self.queue.next().await {
            debug!("Worker {} picked up run {}", worker, admission.run_id);
            let started = Utc::now();
            match self.scheduler.execute(admission.run_id).await {
                Ok(run) => debug!(
                    "Worker {} finished run {} ({}) in {}s",
                    worker,
                    run.id,
                    run.status,
                    (Utc::now() - started).num_seconds()
                ),
                Err(e) => error!("Run {} aborted: {}", admission.run_id, e),
            }
            self.queue.complete(&admission.lane);
        }
    }
}
