//! Startup recovery
//!
//! Settles rollouts interrupted by a restart and re-admits runs that were
//! still executing. Stages caught mid-attempt go back to pending and run
//! again from their first attempt, except a deploy stage whose rollout was
//! rolled back here: it fails and its dependents are skipped.

use chrono::Utc;
use conveyor_core::domain::graph::StageGraph;
use conveyor_core::domain::pipeline::Capability;
use conveyor_core::domain::run::{
    FailureKind, Run, RunEventKind, RunStatus, SkipReason, StageFailure, StageResult, StageStatus,
};
use conveyor_core::domain::trigger::LaneKey;
use serde::Serialize;
use tracing::{info, warn};

use super::Orchestrator;
use super::error::EngineError;
use super::rollout::InterruptedRollout;

/// What recovery found and repaired
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Environments whose interrupted rollout was rolled back
    pub environments: usize,
    /// Runs re-admitted for execution
    pub runs: usize,
}

impl Orchestrator {
    /// Recovers state left behind by a previous process. Must run before
    /// workers start.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let interrupted = self.rollout.recover().await?;
        let environments = interrupted.iter().filter(|r| r.reverted).count();

        let mut runs = self.repos.runs.find_by_status(RunStatus::Running).await?;
        runs.sort_by_key(|run| run.requested_at);

        for run in &mut runs {
            let changes = settle_interrupted_stages(run, &interrupted)?;
            self.repos.runs.save(run).await?;

            for (stage, status, attempt) in changes {
                self.repos
                    .runs
                    .append_event(
                        run.id,
                        RunEventKind::StageChanged {
                            stage,
                            status,
                            attempt,
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
        }

        let report = RecoveryReport {
            environments,
            runs: runs.len(),
        };
        if report != RecoveryReport::default() {
            info!(
                "Recovered {} environment(s) and {} run(s)",
                report.environments, report.runs
            );
        }
        Ok(report)
    }
}

/// Resets or fails every stage of `run` caught mid-attempt and returns the
/// resulting stage changes
fn settle_interrupted_stages(
    run: &mut Run,
    interrupted: &[InterruptedRollout],
) -> Result<Vec<(String, StageStatus, u32)>, EngineError> {
    let graph = StageGraph::build(&run.definition)?;
    let run_id = run.id;
    let now = Utc::now();
    let mut changes = Vec::new();

    let active: Vec<String> = run
        .stages
        .iter()
        .filter(|(_, r)| r.status.is_active())
        .map(|(id, _)| id.clone())
        .collect();

    for id in active {
        let rollout = run
            .definition
            .stage(&id)
            .filter(|s| s.capability == Capability::Deploy)
            .and_then(|s| s.environment.as_deref())
            .and_then(|env| {
                interrupted
                    .iter()
                    .find(|r| r.environment == env && r.run_id == Some(run_id))
            });

        let Some(rollout) = rollout else {
            warn!("Run {}: stage {} interrupted, will run again", run_id, id);
            if let Some(result) = run.stages.get_mut(&id) {
                *result = StageResult::pending();
            }
            changes.push((id, StageStatus::Pending, 0));
            continue;
        };

        let kind = if rollout.reverted {
            FailureKind::HealthCheck
        } else {
            FailureKind::RollbackFailed
        };
        warn!(
            "Run {}: rollout of {} to {} interrupted, failing stage {}",
            run_id,
            rollout.version.as_deref().unwrap_or("<unknown>"),
            rollout.environment,
            id
        );
        if let Some(result) = run.stages.get_mut(&id) {
            result.status = StageStatus::Failed;
            result.completed_at = Some(now);
            result.failure = Some(StageFailure {
                kind,
                message: format!("rollout to {} interrupted by restart", rollout.environment),
            });
            changes.push((id.clone(), StageStatus::Failed, result.attempts));
        }

        for dependent in graph.transitive_dependents(&id) {
            if let Some(result) = run
                .stages
                .get_mut(&dependent)
                .filter(|r| r.status == StageStatus::Pending)
            {
                result.status = StageStatus::Skipped;
                result.completed_at = Some(now);
                result.skip_reason = Some(SkipReason::UpstreamFailed(id.clone()));
                changes.push((dependent, StageStatus::Skipped, 0));
            }
        }
    }

    Ok(changes)
}
