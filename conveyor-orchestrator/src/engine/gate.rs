//! Quality gate evaluation and audited bypasses

use chrono::Utc;
use conveyor_core::domain::gate::{
    ConditionOutcome, GateBypass, GateCondition, GateEvaluation, MetricsPayload, Verdict,
};
use conveyor_core::domain::run::Run;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::error::GateError;
use crate::repository::GateAuditRepository;

/// Evaluates gate conditions against a metrics payload.
///
/// A metric missing from the payload fails its condition. With no
/// conditions the verdict is `pass`.
pub fn evaluate(conditions: &[GateCondition], metrics: &MetricsPayload) -> GateEvaluation {
    let outcomes: Vec<ConditionOutcome> = conditions
        .iter()
        .map(|condition| {
            let observed = metrics.get(&condition.metric).copied();
            let verdict = match observed {
                None => Verdict::Fail,
                Some(value) if !condition.comparator.holds(value, condition.threshold) => {
                    Verdict::Fail
                }
                Some(value) => match condition.warn {
                    Some(warn) if !condition.comparator.holds(value, warn) => Verdict::Warn,
                    _ => Verdict::Pass,
                },
            };
            ConditionOutcome {
                condition: condition.clone(),
                observed,
                verdict,
            }
        })
        .collect();

    let verdict = outcomes
        .iter()
        .map(|o| o.verdict)
        .max()
        .unwrap_or(Verdict::Pass);

    GateEvaluation {
        verdict,
        conditions: outcomes,
        evaluated_at: Utc::now(),
        bypass: None,
    }
}

/// Authorizes gate bypasses and records them in the audit log
pub struct GateKeeper {
    /// token -> actor
    tokens: HashMap<String, String>,
    audit: Arc<dyn GateAuditRepository>,
}

impl GateKeeper {
    pub fn new(tokens: HashMap<String, String>, audit: Arc<dyn GateAuditRepository>) -> Self {
        Self { tokens, audit }
    }

    /// Records a bypass of the run's failing verdict and returns the audit
    /// entry. The caller attaches it to the run.
    pub async fn bypass(
        &self,
        run: &Run,
        token: &str,
        reason: Option<String>,
    ) -> Result<GateBypass, GateError> {
        let Some(actor) = self.tokens.get(token) else {
            warn!("Rejected gate bypass for run {}: unknown token", run.id);
            return Err(GateError::UnknownToken);
        };

        let evaluation = match &run.gate {
            Some(evaluation) if evaluation.verdict == Verdict::Fail && evaluation.bypass.is_none() => {
                evaluation
            }
            _ => return Err(GateError::NotFailing(run.id)),
        };

        let entry = GateBypass {
            id: Uuid::new_v4(),
            run_id: run.id,
            actor: actor.clone(),
            at: Utc::now(),
            waived_conditions: evaluation.failing_conditions(),
            reason,
        };
        self.audit.append(&entry).await?;

        info!(
            "Gate bypass for run {} by {} waiving [{}]",
            run.id,
            entry.actor,
            entry.waived_conditions.join(", ")
        );

        Ok(entry)
    }

    pub async fn audit_log(&self, run_id: Option<Uuid>) -> Result<Vec<GateBypass>, GateError> {
        Ok(self.audit.list(run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::gate::Comparator;
    use conveyor_core::domain::pipeline::{Capability, PipelineDefinition, StageDefinition};
    use conveyor_core::domain::run::TriggerContext;

    use crate::repository::gate::InMemoryGateAuditRepository;

    fn conditions() -> Vec<GateCondition> {
        vec![
            GateCondition::new("bugs", Comparator::Le, 0.0),
            GateCondition::new("coverage", Comparator::Ge, 80.0),
        ]
    }

    fn metrics(bugs: f64, coverage: f64) -> MetricsPayload {
        MetricsPayload::from([
            ("bugs".to_string(), bugs),
            ("coverage".to_string(), coverage),
        ])
    }

    #[test]
    fn test_passing_metrics() {
        let evaluation = evaluate(&conditions(), &metrics(0.0, 85.0));
        assert_eq!(evaluation.verdict, Verdict::Pass);
        assert!(evaluation.is_acceptable());
    }

    #[test]
    fn test_failing_metrics() {
        let evaluation = evaluate(&conditions(), &metrics(2.0, 85.0));
        assert_eq!(evaluation.verdict, Verdict::Fail);
        assert_eq!(evaluation.failing_conditions(), vec!["bugs <= 0"]);
        assert!(!evaluation.is_acceptable());
    }

    #[test]
    fn test_missing_metric_fails() {
        let payload = MetricsPayload::from([("bugs".to_string(), 0.0)]);
        let evaluation = evaluate(&conditions(), &payload);
        assert_eq!(evaluation.verdict, Verdict::Fail);
        assert_eq!(evaluation.conditions[1].observed, None);
    }

    #[test]
    fn test_warning_band() {
        let conditions = vec![GateCondition::new("coverage", Comparator::Ge, 80.0).with_warn(90.0)];

        assert_eq!(evaluate(&conditions, &metrics(0.0, 85.0)).verdict, Verdict::Warn);
        assert_eq!(evaluate(&conditions, &metrics(0.0, 95.0)).verdict, Verdict::Pass);
        assert_eq!(evaluate(&conditions, &metrics(0.0, 70.0)).verdict, Verdict::Fail);
    }

    #[test]
    fn test_no_conditions_pass() {
        assert_eq!(evaluate(&[], &MetricsPayload::new()).verdict, Verdict::Pass);
    }

    fn failed_run() -> Run {
        let definition = PipelineDefinition {
            name: "p".to_string(),
            repository: "acme/p".to_string(),
            description: None,
            stages: vec![StageDefinition::new("analyze", Capability::Analyze)],
            gates: conditions(),
            canary: None,
        };
        let mut run = Run::new(
            definition,
            TriggerContext {
                repository: "acme/p".to_string(),
                branch: "main".to_string(),
                change_ref: "abc".to_string(),
            },
        );
        run.gate = Some(evaluate(&conditions(), &metrics(3.0, 50.0)));
        run
    }

    #[tokio::test]
    async fn test_bypass_is_audited() {
        let audit = Arc::new(InMemoryGateAuditRepository::default());
        let keeper = GateKeeper::new(
            HashMap::from([("s3cret".to_string(), "alice".to_string())]),
            audit.clone(),
        );
        let run = failed_run();

        let entry = keeper
            .bypass(&run, "s3cret", Some("hotfix".to_string()))
            .await
            .unwrap();
        assert_eq!(entry.actor, "alice");
        assert_eq!(entry.waived_conditions, vec!["bugs <= 0", "coverage >= 80"]);

        let log = keeper.audit_log(Some(run.id)).await.unwrap();
        assert_eq!(log, vec![entry]);
    }

    #[tokio::test]
    async fn test_bypass_rejections() {
        let keeper = GateKeeper::new(
            HashMap::from([("s3cret".to_string(), "alice".to_string())]),
            Arc::new(InMemoryGateAuditRepository::default()),
        );
        let mut run = failed_run();

        assert!(matches!(
            keeper.bypass(&run, "guess", None).await,
            Err(GateError::UnknownToken)
        ));

        run.gate = Some(evaluate(&conditions(), &metrics(0.0, 99.0)));
        assert!(matches!(
            keeper.bypass(&run, "s3cret", None).await,
            Err(GateError::NotFailing(_))
        ));
    }
}
