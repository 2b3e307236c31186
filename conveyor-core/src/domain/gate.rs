//! Quality gate domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metrics produced by an analysis stage (defect counts, coverage, ...)
pub type MetricsPayload = BTreeMap<String, f64>;

/// A single threshold condition of a quality gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCondition {
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Stricter threshold forming a warning band: a value that satisfies
    /// `threshold` but not `warn` yields a `warn` verdict.
    #[serde(default)]
    pub warn: Option<f64>,
}

impl GateCondition {
    pub fn new(metric: impl Into<String>, comparator: Comparator, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            comparator,
            threshold,
            warn: None,
        }
    }

    pub fn with_warn(mut self, warn: f64) -> Self {
        self.warn = Some(warn);
        self
    }
}

impl std::fmt::Display for GateCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.metric, self.comparator, self.threshold)
    }
}

/// Comparison operator of a gate condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Comparator {
    /// Whether `observed <op> threshold` holds
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => observed < threshold,
            Comparator::Le => observed <= threshold,
            Comparator::Gt => observed > threshold,
            Comparator::Ge => observed >= threshold,
            Comparator::Eq => (observed - threshold).abs() < f64::EPSILON,
            Comparator::Ne => (observed - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        };
        write!(f, "{}", op)
    }
}

impl std::str::FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" | "lt" => Ok(Comparator::Lt),
            "<=" | "le" => Ok(Comparator::Le),
            ">" | "gt" => Ok(Comparator::Gt),
            ">=" | "ge" => Ok(Comparator::Ge),
            "==" | "eq" => Ok(Comparator::Eq),
            "!=" | "ne" => Ok(Comparator::Ne),
            other => Err(format!("unknown comparator '{}'", other)),
        }
    }
}

/// Gate verdict, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Warn => write!(f, "warn"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

/// Outcome of one condition against the metrics payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionOutcome {
    pub condition: GateCondition,
    /// `None` when the metric was missing from the payload
    pub observed: Option<f64>,
    pub verdict: Verdict,
}

/// Result of evaluating a run's quality gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateEvaluation {
    pub verdict: Verdict,
    pub conditions: Vec<ConditionOutcome>,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub bypass: Option<GateBypass>,
}

impl GateEvaluation {
    /// Whether gated work (packaging, promotion) may proceed
    pub fn is_acceptable(&self) -> bool {
        self.verdict != Verdict::Fail || self.bypass.is_some()
    }

    /// Human-readable descriptions of the failing conditions
    pub fn failing_conditions(&self) -> Vec<String> {
        self.conditions
            .iter()
            .filter(|c| c.verdict == Verdict::Fail)
            .map(|c| c.condition.to_string())
            .collect()
    }
}

/// Immutable audit entry recorded for every gate bypass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateBypass {
    pub id: Uuid,
    pub run_id: Uuid,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub waived_conditions: Vec<String>,
    pub reason: Option<String>,
}
