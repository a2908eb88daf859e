use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::AlertEvent;
use crate::notifications::dispatcher::FanOutSummary;

use super::evaluation_service::EvaluationError;

/// One metric reading reported by a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub machine_id: i64,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    NoChange,
    Triggered(AlertEvent),
    Resolved(AlertEvent),
}

/// Result of evaluating one rule against a sample.
#[derive(Debug)]
pub struct RuleOutcome {
    pub rule_id: i64,
    pub result: Result<EvaluationOutcome, EvaluationError>,
    /// Present when the rule triggered and the fan-out ran.
    pub fan_out: Option<FanOutSummary>,
}

#[derive(Debug, Default)]
pub struct SampleReport {
    pub rules: Vec<RuleOutcome>,
}

impl SampleReport {
    pub fn triggered(&self) -> impl Iterator<Item = &AlertEvent> {
        self.rules.iter().filter_map(|r| match &r.result {
            Ok(EvaluationOutcome::Triggered(event)) => Some(event),
            _ => None,
        })
    }

    pub fn resolved(&self) -> impl Iterator<Item = &AlertEvent> {
        self.rules.iter().filter_map(|r| match &r.result {
            Ok(EvaluationOutcome::Resolved(event)) => Some(event),
            _ => None,
        })
    }

    pub fn errors(&self) -> impl Iterator<Item = (i64, &EvaluationError)> {
        self.rules
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|e| (r.rule_id, e)))
    }
}
