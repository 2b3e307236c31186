//! Stage scheduler
//!
//! Drives one run to a terminal status: computes the ready set, dispatches
//! ready stages as independent tasks bounded by a global semaphore and a
//! per-run limit, retries failed attempts with exponential backoff and
//! propagates failures to dependent stages. Every transition is persisted
//! as a run snapshot plus an event.

use chrono::Utc;
use conveyor_core::domain::artifact::{Artifact, ArtifactState};
use conveyor_core::domain::deployment::Deployment;
use conveyor_core::domain::gate::{GateEvaluation, MetricsPayload};
use conveyor_core::domain::graph::StageGraph;
use conveyor_core::domain::pipeline::{CanaryPolicy, Capability};
use conveyor_core::domain::run::{
    Run, RunEventKind, RunStatus, SkipReason, StageFailure, StageResult, StageStatus,
};
use futures::FutureExt;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::adapter::{AdapterRegistry, StageAdapter, StageContext, StageOutput};
use crate::engine::artifact::ArtifactManager;
use crate::engine::error::{ArtifactPublishError, EngineError, RolloutError, StageError};
use crate::engine::gate;
use crate::engine::rollout::{RolloutController, RolloutRequest};
use crate::repository::RunRepository;

/// Upper bound of the exponential part of the retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Retry delay before `attempt + 1`: `base * 2^(attempt-1)` capped at
/// [`MAX_BACKOFF`], without jitter
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = base_ms
        .saturating_mul(1u64 << exponent)
        .min(MAX_BACKOFF.as_millis() as u64);
    Duration::from_millis(delay_ms)
}

/// Adds uniform jitter of up to half the delay
fn with_jitter(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    delay + Duration::from_millis(jitter)
}

/// What a finished stage task produced
enum StageProduct {
    Output(StageOutput),
    Packaged(StageOutput, Artifact),
    Deployed(Deployment),
}

struct StageCompletion {
    stage: String,
    attempts: u32,
    /// False when the task ended before it got a stage slot
    started: bool,
    result: Result<StageProduct, StageError>,
}

/// Status change reported by a stage task while it runs
struct StageProgress {
    stage: String,
    status: StageStatus,
    attempt: u32,
}

/// Everything a stage task needs, owned so it can move into the task
struct StageJob {
    ctx: StageContext,
    adapter: Arc<dyn StageAdapter>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    progress: mpsc::UnboundedSender<StageProgress>,
    artifacts: Arc<ArtifactManager>,
    rollout: Arc<RolloutController>,
    artifact_version: Option<String>,
    canary: CanaryPolicy,
}

#[derive(Default)]
struct Control {
    tokens: HashMap<Uuid, CancellationToken>,
    executing: HashSet<Uuid>,
}

pub struct Scheduler {
    runs: Arc<dyn RunRepository>,
    adapters: AdapterRegistry,
    artifacts: Arc<ArtifactManager>,
    rollout: Arc<RolloutController>,
    /// Stage slots shared by all runs
    permits: Arc<Semaphore>,
    per_run_limit: usize,
    default_canary: CanaryPolicy,
    control: Mutex<Control>,
}

impl Scheduler {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        adapters: AdapterRegistry,
        artifacts: Arc<ArtifactManager>,
        rollout: Arc<RolloutController>,
        max_concurrent_stages: usize,
        per_run_limit: usize,
        default_canary: CanaryPolicy,
    ) -> Self {
        Self {
            runs,
            adapters,
            artifacts,
            rollout,
            permits: Arc::new(Semaphore::new(max_concurrent_stages.max(1))),
            per_run_limit: per_run_limit.max(1),
            default_canary,
            control: Mutex::new(Control::default()),
        }
    }

    fn control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers the cancellation token of a newly admitted run
    pub fn register(&self, run_id: Uuid) -> CancellationToken {
        self.control()
            .tokens
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn forget(&self, run_id: Uuid) {
        let mut control = self.control();
        control.tokens.remove(&run_id);
        control.executing.remove(&run_id);
    }

    /// Requests cooperative cancellation of a run.
    ///
    /// A run still waiting for a worker is settled immediately; an
    /// executing run is settled by its executor.
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let mut run = self
            .runs
            .find(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "run {} is already {}",
                run_id, run.status
            )));
        }

        let executing = {
            let mut control = self.control();
            control
                .tokens
                .entry(run_id)
                .or_insert_with(CancellationToken::new)
                .cancel();
            control.executing.contains(&run_id)
        };
        info!("Cancellation requested for run {}", run_id);

        if executing {
            return Ok(run);
        }

        self.skip_pending(&mut run, SkipReason::Cancelled).await?;
        self.finish(&mut run, RunStatus::Cancelled).await?;
        self.control().tokens.remove(&run_id);
        Ok(run)
    }

    /// Executes a run until it is terminal
    pub async fn execute(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let token = {
            let mut control = self.control();
            control.executing.insert(run_id);
            control
                .tokens
                .entry(run_id)
                .or_insert_with(CancellationToken::new)
                .clone()
        };

        let result = self.drive(run_id, token).await;
        self.forget(run_id);
        result
    }

    async fn drive(&self, run_id: Uuid, token: CancellationToken) -> Result<Run, EngineError> {
        let mut run = self
            .runs
            .find(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            debug!("Run {} is already {}, nothing to execute", run_id, run.status);
            return Ok(run);
        }

        let graph = StageGraph::build(&run.definition)?;
        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
            self.runs.save(&run).await?;
        }
        info!(
            "Executing run {} of pipeline {} ({}@{})",
            run.id, run.pipeline, run.trigger.repository, run.trigger.change_ref
        );

        let mut tasks: JoinSet<StageCompletion> = JoinSet::new();
        // Stages with a task, whether or not it holds a slot yet
        let mut dispatched: HashSet<String> = HashSet::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut cancelled = false;

        loop {
            if !cancelled && token.is_cancelled() {
                cancelled = true;
                warn!("Run {} cancelled, stopping in-flight stages", run.id);
                self.skip_pending(&mut run, SkipReason::Cancelled).await?;
            }
            if !cancelled {
                self.dispatch_ready(
                    &mut run,
                    &graph,
                    &mut tasks,
                    &mut dispatched,
                    &progress_tx,
                    &token,
                )
                .await?;
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = token.cancelled(), if !cancelled => {}
                Some(progress) = progress_rx.recv() => {
                    self.on_progress(&mut run, progress).await?;
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(completion) => {
                        dispatched.remove(&completion.stage);
                        self.on_completion(&mut run, &graph, completion).await?;
                    }
                    Err(e) => error!("Stage task of run {} aborted: {}", run.id, e),
                },
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            if !run.all_settled() {
                error!("Run {} stopped with unsettled stages", run.id);
            }
            run.settled_status()
        };
        self.finish(&mut run, status).await?;
        Ok(run)
    }

    async fn finish(&self, run: &mut Run, status: RunStatus) -> Result<(), EngineError> {
        run.status = status;
        run.completed_at = Some(Utc::now());
        self.runs.save(run).await?;
        self.runs
            .append_event(run.id, RunEventKind::StatusChanged { status })
            .await?;

        match status {
            RunStatus::Succeeded => info!("Run {} succeeded", run.id),
            _ => warn!(
                "Run {} finished {} (exit code {})",
                run.id,
                status,
                run.outcome().map_or(1, |o| o.exit_code())
            ),
        }
        Ok(())
    }

    /// Applies a stage update, then persists the snapshot and an event
    async fn transition<F>(&self, run: &mut Run, stage: &str, update: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut StageResult),
    {
        let Some(result) = run.stages.get_mut(stage) else {
            return Err(EngineError::InvalidState(format!(
                "run {} has no stage '{}'",
                run.id, stage
            )));
        };
        update(result);
        let (status, attempt) = (result.status, result.attempts);

        self.runs.save(run).await?;
        self.runs
            .append_event(
                run.id,
                RunEventKind::StageChanged {
                    stage: stage.to_string(),
                    status,
                    attempt,
                },
            )
            .await?;
        Ok(())
    }

    /// Whether every analysis stage of the run has settled
    fn analysis_settled(run: &Run) -> bool {
        run.definition
            .stages
            .iter()
            .filter(|s| s.capability == Capability::Analyze)
            .all(|s| run.stages.get(&s.id).is_some_and(|r| r.status.is_settled()))
    }

    /// Dispatches ready stages until nothing more can start
    async fn dispatch_ready(
        &self,
        run: &mut Run,
        graph: &StageGraph,
        tasks: &mut JoinSet<StageCompletion>,
        dispatched: &mut HashSet<String>,
        progress: &mpsc::UnboundedSender<StageProgress>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let has_gate_stage = run.definition.has_gate_stage();
        let has_analysis = run
            .definition
            .stages
            .iter()
            .any(|s| s.capability == Capability::Analyze);

        loop {
            let mut changed = false;

            if has_analysis && run.gate.is_none() && Self::analysis_settled(run) {
                self.ensure_gate(run).await?;
            }

            let ready: Vec<String> = graph
                .ready_stages(&run.stages)
                .into_iter()
                .filter(|id| !dispatched.contains(id))
                .collect();

            for id in ready {
                let Some(stage) = run.definition.stage(&id).cloned() else {
                    continue;
                };

                if stage.is_gate_dependent(has_gate_stage) {
                    if !Self::analysis_settled(run) {
                        debug!(
                            "Stage {} of run {} waits for analysis to finish",
                            id, run.id
                        );
                        continue;
                    }
                    let evaluation = self.ensure_gate(run).await?;
                    if !evaluation.is_acceptable() {
                        if stage.capability == Capability::Gate {
                            let failing = evaluation.failing_conditions().join(", ");
                            warn!("Quality gate of run {} failed: {}", run.id, failing);
                            self.fail_stage(run, graph, &id, 1, StageError::QualityGate(failing))
                                .await?;
                        } else {
                            info!("Stage {} of run {} blocked by quality gate", id, run.id);
                            self.skip_stage(run, &id, SkipReason::GateBlocked).await?;
                            self.skip_dependents(run, graph, &id).await?;
                        }
                        changed = true;
                        continue;
                    }
                }

                if stage.capability == Capability::Gate {
                    let now = Utc::now();
                    self.transition(run, &id, |r| {
                        r.status = StageStatus::Succeeded;
                        r.attempts = 1;
                        r.started_at = Some(now);
                        r.completed_at = Some(now);
                    })
                    .await?;
                    changed = true;
                    continue;
                }

                if tasks.len() >= self.per_run_limit {
                    break;
                }

                if !graph.dependencies_met(&id, &run.stages) {
                    error!(
                        "Stage {} of run {} dispatched with unmet dependencies",
                        id, run.id
                    );
                    self.fail_stage(
                        run,
                        graph,
                        &id,
                        0,
                        StageError::DependencyUnmet(graph.dependencies(&id).join(", ")),
                    )
                    .await?;
                    changed = true;
                    continue;
                }

                let adapter = match self.adapters.resolve(&stage) {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        self.fail_stage(run, graph, &id, 0, e).await?;
                        changed = true;
                        continue;
                    }
                };

                info!(
                    "Dispatching stage {} ({}) of run {}",
                    id, stage.capability, run.id
                );

                let job = StageJob {
                    ctx: StageContext {
                        run_id: run.id,
                        pipeline: run.pipeline.clone(),
                        stage,
                        trigger: run.trigger.clone(),
                        attempt: 1,
                    },
                    adapter,
                    permits: self.permits.clone(),
                    cancel: token.child_token(),
                    progress: progress.clone(),
                    artifacts: self.artifacts.clone(),
                    rollout: self.rollout.clone(),
                    artifact_version: run.artifact_version.clone(),
                    canary: run
                        .definition
                        .canary
                        .clone()
                        .unwrap_or_else(|| self.default_canary.clone()),
                };
                dispatched.insert(id.clone());
                tasks.spawn(async move {
                    let stage = job.ctx.stage.id.clone();
                    match AssertUnwindSafe(job.run()).catch_unwind().await {
                        Ok(completion) => completion,
                        Err(_) => StageCompletion {
                            stage,
                            attempts: 1,
                            started: true,
                            result: Err(StageError::Execution("stage task panicked".to_string())),
                        },
                    }
                });
                changed = true;
            }

            if !changed {
                return Ok(());
            }
        }
    }

    /// Returns the run's gate evaluation. The first call evaluates the gate
    /// against the merged metrics of every analysis; later calls reuse it.
    async fn ensure_gate(&self, run: &mut Run) -> Result<GateEvaluation, EngineError> {
        if let Some(evaluation) = &run.gate {
            return Ok(evaluation.clone());
        }
        let metrics = run.metrics.clone().unwrap_or_default();
        self.record_gate(run, &metrics).await
    }

    async fn record_gate(
        &self,
        run: &mut Run,
        metrics: &MetricsPayload,
    ) -> Result<GateEvaluation, EngineError> {
        let evaluation = gate::evaluate(&run.definition.gates, metrics);
        info!(
            "Quality gate of run {}: {} ({} conditions)",
            run.id,
            evaluation.verdict,
            evaluation.conditions.len()
        );
        run.gate = Some(evaluation.clone());
        self.runs.save(run).await?;
        self.runs
            .append_event(
                run.id,
                RunEventKind::GateEvaluated {
                    verdict: evaluation.verdict,
                },
            )
            .await?;
        Ok(evaluation)
    }

    async fn on_progress(&self, run: &mut Run, progress: StageProgress) -> Result<(), EngineError> {
        // A dispatched stage starts once its task holds a slot; reports
        // arriving after the stage settled are ignored
        let accepted = run.stages.get(&progress.stage).is_some_and(|r| {
            r.status.is_active()
                || (r.status == StageStatus::Pending && progress.status == StageStatus::Running)
        });
        if !accepted {
            return Ok(());
        }
        let now = Utc::now();
        self.transition(run, &progress.stage, |r| {
            if r.status == StageStatus::Pending {
                r.started_at = Some(now);
            }
            r.status = progress.status;
            r.attempts = progress.attempt;
        })
        .await
    }

    async fn on_completion(
        &self,
        run: &mut Run,
        graph: &StageGraph,
        completion: StageCompletion,
    ) -> Result<(), EngineError> {
        let StageCompletion {
            stage,
            attempts,
            started,
            result,
        } = completion;

        let status = run.stages.get(&stage).map(|r| r.status);
        if status.is_some_and(|s| s.is_settled()) {
            debug!("Stage {} of run {} already settled", stage, run.id);
            return Ok(());
        }
        if !started && status == Some(StageStatus::Pending) {
            return self.skip_stage(run, &stage, SkipReason::Cancelled).await;
        }

        let product = match result {
            Ok(product) => product,
            Err(e) => return self.fail_stage(run, graph, &stage, attempts, e).await,
        };

        let output_ref = match product {
            StageProduct::Output(output) => {
                let is_analysis = run
                    .definition
                    .stage(&stage)
                    .is_some_and(|s| s.capability == Capability::Analyze);
                if is_analysis {
                    let metrics = output.metrics.clone().unwrap_or_default();
                    run.metrics.get_or_insert_with(MetricsPayload::default).extend(metrics);
                }
                output.output_ref
            }
            StageProduct::Packaged(output, artifact) => {
                run.artifact_version = Some(artifact.version.clone());
                self.runs
                    .append_event(
                        run.id,
                        RunEventKind::ArtifactRegistered {
                            version: artifact.version.clone(),
                        },
                    )
                    .await?;
                output.output_ref.or(Some(artifact.content_ref))
            }
            StageProduct::Deployed(deployment) => {
                if let Err(e) = self.artifacts.promote(run, &deployment).await {
                    let error = self.withdraw(&deployment, e).await;
                    return self.fail_stage(run, graph, &stage, attempts, error).await;
                }
                None
            }
        };

        debug!(
            "Stage {} of run {} succeeded after {} attempt(s)",
            stage, run.id, attempts
        );
        let now = Utc::now();
        self.transition(run, &stage, |r| {
            r.status = StageStatus::Succeeded;
            r.attempts = attempts.max(1);
            r.started_at.get_or_insert(now);
            r.completed_at = Some(now);
            r.output_ref = output_ref;
            r.failure = None;
        })
        .await
    }

    /// Takes a healthy rollout whose artifact could not be promoted back out
    /// of its environment and returns the error to fail the stage with
    async fn withdraw(&self, deployment: &Deployment, cause: ArtifactPublishError) -> StageError {
        let Some(version) = deployment.current_version.as_deref() else {
            return cause.into();
        };
        warn!(
            "Promotion of {} failed, withdrawing it from {}: {}",
            version, deployment.environment, cause
        );
        match self.rollout.withdraw(&deployment.environment, version).await {
            Ok(_) => cause.into(),
            Err(e) => {
                error!("Withdrawing {} from {} failed: {}", version, deployment.environment, e);
                e.into()
            }
        }
    }

    /// Records a terminal stage failure and skips everything downstream
    async fn fail_stage(
        &self,
        run: &mut Run,
        graph: &StageGraph,
        stage: &str,
        attempts: u32,
        error: StageError,
    ) -> Result<(), EngineError> {
        let kind = error.kind();
        let optional = run.definition.stage(stage).is_some_and(|s| s.optional);
        if optional {
            warn!("Optional stage {} of run {} failed: {}", stage, run.id, error);
        } else {
            warn!("Stage {} of run {} failed: {}", stage, run.id, error);
        }

        let now = Utc::now();
        self.transition(run, stage, |r| {
            r.status = StageStatus::Failed;
            r.attempts = attempts.max(r.attempts);
            r.started_at.get_or_insert(now);
            r.completed_at = Some(now);
            r.failure = Some(StageFailure {
                kind,
                message: error.to_string(),
            });
        })
        .await?;

        self.skip_dependents(run, graph, stage).await
    }

    async fn skip_stage(
        &self,
        run: &mut Run,
        stage: &str,
        reason: SkipReason,
    ) -> Result<(), EngineError> {
        self.transition(run, stage, |r| {
            r.status = StageStatus::Skipped;
            r.completed_at = Some(Utc::now());
            r.skip_reason = Some(reason);
        })
        .await
    }

    /// Skips every pending stage that transitively depends on `stage`
    async fn skip_dependents(
        &self,
        run: &mut Run,
        graph: &StageGraph,
        stage: &str,
    ) -> Result<(), EngineError> {
        for dependent in graph.transitive_dependents(stage) {
            let pending = run
                .stages
                .get(&dependent)
                .is_some_and(|r| r.status == StageStatus::Pending);
            if pending {
                debug!("Skipping stage {} of run {}: {} did not succeed", dependent, run.id, stage);
                self.skip_stage(run, &dependent, SkipReason::UpstreamFailed(stage.to_string()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn skip_pending(&self, run: &mut Run, reason: SkipReason) -> Result<(), EngineError> {
        let pending: Vec<String> = run
            .stages
            .iter()
            .filter(|(_, r)| r.status == StageStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            self.skip_stage(run, &id, reason.clone()).await?;
        }
        Ok(())
    }
}

impl StageJob {
    async fn run(mut self) -> StageCompletion {
        let stage = self.ctx.stage.id.clone();

        let Some(permit) = self.acquire().await else {
            return StageCompletion {
                stage,
                attempts: 0,
                started: false,
                result: Err(StageError::Cancelled),
            };
        };
        // Held while an attempt runs, released during backoff
        let mut permit = permit;
        self.report(StageStatus::Running, 1);

        let policy = self.ctx.stage.retry;
        // A failed rollout has already been rolled back
        let max_attempts = match self.ctx.stage.capability {
            Capability::Deploy => 1,
            _ => policy.max_attempts.max(1),
        };
        let mut attempt = 1;

        loop {
            self.ctx.attempt = attempt;
            match self.attempt().await {
                Ok(product) => {
                    return StageCompletion {
                        stage,
                        attempts: attempt,
                        started: true,
                        result: Ok(product),
                    };
                }
                Err(e)
                    if attempt < max_attempts
                        && e.is_retryable()
                        && !self.cancel.is_cancelled() =>
                {
                    let delay = with_jitter(backoff_delay(policy.backoff_base_ms, attempt));
                    warn!(
                        "Stage {} attempt {}/{} failed: {}; retrying in {:?}",
                        stage, attempt, max_attempts, e, delay
                    );
                    self.report(StageStatus::Retrying, attempt);
                    drop(permit);

                    let resumed = tokio::select! {
                        _ = tokio::time::sleep(delay) => self.acquire().await,
                        _ = self.cancel.cancelled() => None,
                    };
                    let Some(next) = resumed else {
                        return StageCompletion {
                            stage,
                            attempts: attempt,
                            started: true,
                            result: Err(StageError::Cancelled),
                        };
                    };
                    permit = next;

                    attempt += 1;
                    self.report(StageStatus::Running, attempt);
                }
                Err(e) => {
                    return StageCompletion {
                        stage,
                        attempts: attempt,
                        started: true,
                        result: Err(e),
                    };
                }
            }
        }
    }

    /// Waits for a stage slot; `None` once the stage is cancelled
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }

    fn report(&self, status: StageStatus, attempt: u32) {
        // The executor outlives its stage tasks
        let _ = self.progress.send(StageProgress {
            stage: self.ctx.stage.id.clone(),
            status,
            attempt,
        });
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.stage.timeout_seconds)
    }

    async fn attempt(&self) -> Result<StageProduct, StageError> {
        match self.ctx.stage.capability {
            Capability::Deploy => self.deploy().await,
            Capability::Package => {
                let output = self.invoke().await?;
                let handle = output.artifact.clone().ok_or_else(|| {
                    StageError::Execution("package stage produced no artifact".to_string())
                })?;
                let artifact = self
                    .artifacts
                    .register(&self.ctx.pipeline, self.ctx.run_id, &handle)
                    .await?;
                Ok(StageProduct::Packaged(output, artifact))
            }
            _ => Ok(StageProduct::Output(self.invoke().await?)),
        }
    }

    /// Runs the adapter once, bounded by the stage timeout
    async fn invoke(&self) -> Result<StageOutput, StageError> {
        let limit = self.timeout();
        let token = self.cancel.child_token();
        match tokio::time::timeout(limit, self.adapter.run(&self.ctx, token.clone())).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(StageError::Timeout(limit))
            }
        }
    }

    /// Hands the run's artifact to the rollout controller. The stage
    /// deadline cancels the rollout, which then rolls back.
    async fn deploy(&self) -> Result<StageProduct, StageError> {
        let environment = self.ctx.stage.environment.clone().ok_or_else(|| {
            StageError::Execution(format!(
                "deploy stage '{}' names no environment",
                self.ctx.stage.id
            ))
        })?;
        let version = self.artifact_version.clone().ok_or_else(|| {
            StageError::Execution("run produced no artifact to deploy".to_string())
        })?;
        let artifact = self
            .artifacts
            .find(&self.ctx.pipeline, &version)
            .await?
            .ok_or_else(|| StageError::Execution(format!("artifact {} is not registered", version)))?;
        if !matches!(artifact.state, ArtifactState::Staged | ArtifactState::Released) {
            return Err(ArtifactPublishError::NotPromotable {
                version,
                state: artifact.state,
            }
            .into());
        }

        let limit = self.timeout();
        let token = self.cancel.child_token();
        let deadline = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        };

        let result = self
            .rollout
            .deploy(
                RolloutRequest {
                    environment,
                    pipeline: self.ctx.pipeline.clone(),
                    run_id: self.ctx.run_id,
                    artifact,
                    policy: self.canary.clone(),
                },
                token,
            )
            .await;
        deadline.abort();

        match result {
            Ok(deployment) => Ok(StageProduct::Deployed(deployment)),
            Err(RolloutError::Cancelled { .. }) if !self.cancel.is_cancelled() => {
                Err(StageError::Timeout(limit))
            }
            Err(e) => Err(e.into()),
        }
    }
}
