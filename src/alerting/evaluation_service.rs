use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::models::{EvaluationOutcome, MetricSample, RuleOutcome, SampleReport};
use super::state::{RuleEvaluationState, Transition};
use crate::db::models::{AlertEvent, AlertRule, UpdateAlertRule};
use crate::db::services::{alert_service, machine_service};
use crate::db::{DbError, DbPool};
use crate::notifications::dispatcher::{DispatchError, FanOutSummary, NotificationDispatcher};
use crate::notifications::models::Notification;

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Database error: {0}")]
    Persistence(#[from] DbError),
    #[error("Notification error: {0}")]
    Dispatch(#[from] DispatchError),
}

type StateKey = (i64, i64);

/// Turns metric samples into alert events. Holds one breach counter per
/// (rule, machine); updates for the same key are serialized by its mutex.
pub struct AlertEvaluator {
    pool: DbPool,
    dispatcher: Arc<NotificationDispatcher>,
    states: DashMap<StateKey, Arc<Mutex<RuleEvaluationState>>>,
}

fn is_unique_violation(err: &DbError) -> bool {
    matches!(err, DbError::Sqlx(sqlx::Error::Database(db)) if db.is_unique_violation())
}

impl AlertEvaluator {
    pub fn new(pool: DbPool, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            pool,
            dispatcher,
            states: DashMap::new(),
        }
    }

    fn state_for(&self, key: StateKey) -> Arc<Mutex<RuleEvaluationState>> {
        self.states
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(RuleEvaluationState::default())))
            .clone()
    }

    /// Evaluates one sample against one rule for one machine and persists any
    /// resulting event change. Does not notify.
    pub async fn evaluate(
        &self,
        rule: &AlertRule,
        machine_id: i64,
        value: f64,
        sample_time: DateTime<Utc>,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        if !rule.is_active {
            return Ok(EvaluationOutcome::NoChange);
        }
        if !value.is_finite() {
            warn!(rule_id = rule.id, machine_id, value, "Non-finite sample treated as non-breach.");
        }

        let state = self.state_for((rule.id, machine_id));
        let mut state = state.lock().await;

        if !state.loaded {
            // Re-attach to an event left open before a restart.
            let open = alert_service::get_open_event(&self.pool, rule.id, machine_id).await?;
            *state = RuleEvaluationState::load(open.map(|e| e.id));
        }

        let breached = rule.comparison.is_breached(value, rule.threshold);
        match state.apply(breached, rule.required_breaches()) {
            Transition::None => Ok(EvaluationOutcome::NoChange),
            Transition::Open => {
                match alert_service::create_alert_event(&self.pool, rule.id, machine_id, value, sample_time).await {
                    Ok(event) => {
                        state.mark_opened(event.id);
                        info!(
                            rule_id = rule.id,
                            rule_name = %rule.name,
                            machine_id,
                            event_id = event.id,
                            value,
                            "Alert rule triggered."
                        );
                        Ok(EvaluationOutcome::Triggered(event))
                    }
                    Err(e) if is_unique_violation(&e) => {
                        // Another writer opened it first; adopt that event.
                        let open = alert_service::get_open_event(&self.pool, rule.id, machine_id).await?;
                        if let Some(event) = open {
                            state.mark_opened(event.id);
                        }
                        Ok(EvaluationOutcome::NoChange)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Transition::Resolve(event_id) => {
                let resolved = alert_service::resolve_alert_event(&self.pool, event_id, sample_time).await?;
                state.mark_resolved();
                match resolved {
                    Some(event) => {
                        info!(rule_id = rule.id, machine_id, event_id, "Alert event resolved.");
                        Ok(EvaluationOutcome::Resolved(event))
                    }
                    None => {
                        debug!(rule_id = rule.id, event_id, "Alert event was already resolved.");
                        Ok(EvaluationOutcome::NoChange)
                    }
                }
            }
        }
    }

    /// Fans out a triggered event to every active channel of the rule's owner.
    pub async fn notify_triggered(
        &self,
        rule: &AlertRule,
        event: &AlertEvent,
        machine_name: &str,
    ) -> Result<FanOutSummary, DispatchError> {
        let notification = Notification::alert_triggered(rule, event, machine_name);
        self.dispatcher.fan_out(rule.user_id, &notification).await
    }

    /// Ingestion entry point: records the machine as seen, evaluates every
    /// active rule watching the metric, and notifies on each trigger. A failing
    /// rule does not stop the others.
    pub async fn handle_sample(&self, sample: &MetricSample) -> Result<SampleReport, EvaluationError> {
        let machine = machine_service::get_machine(&self.pool, sample.machine_id).await?;
        machine_service::touch_last_seen(&self.pool, machine.id, sample.timestamp).await?;

        let rules =
            alert_service::get_active_rules_for_metric(&self.pool, machine.user_id, &sample.metric, machine.id)
                .await?;
        debug!(
            machine_id = machine.id,
            metric = %sample.metric,
            rules = rules.len(),
            "Evaluating sample."
        );

        let mut report = SampleReport::default();
        for rule in &rules {
            let result = self.evaluate(rule, machine.id, sample.value, sample.timestamp).await;
            let fan_out = match &result {
                Ok(EvaluationOutcome::Triggered(event)) => {
                    match self.notify_triggered(rule, event, &machine.name).await {
                        Ok(summary) => Some(summary),
                        Err(e) => {
                            error!(rule_id = rule.id, error = %e, "Failed to send notifications for alert rule.");
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    error!(rule_id = rule.id, rule_name = %rule.name, error = %e, "Error evaluating rule.");
                    None
                }
            };
            report.rules.push(RuleOutcome {
                rule_id: rule.id,
                result,
                fan_out,
            });
        }
        Ok(report)
    }

    /// Drops in-memory state for a rule after it was edited or deleted.
    pub fn forget_rule(&self, rule_id: i64) {
        self.states.retain(|(id, _), _| *id != rule_id);
    }

    /// Applies a rule edit and starts its counters over.
    pub async fn update_rule(
        &self,
        rule_id: i64,
        user_id: i64,
        payload: UpdateAlertRule,
    ) -> Result<AlertRule, EvaluationError> {
        let rule = alert_service::update_alert_rule(&self.pool, rule_id, user_id, payload).await?;
        self.forget_rule(rule.id);
        Ok(rule)
    }

    pub async fn set_rule_active(&self, rule_id: i64, user_id: i64, is_active: bool) -> Result<(), EvaluationError> {
        alert_service::set_alert_rule_active(&self.pool, rule_id, user_id, is_active).await?;
        self.forget_rule(rule_id);
        Ok(())
    }

    /// Deletes the rule and its counters. Past events are kept.
    pub async fn delete_rule(&self, rule_id: i64, user_id: i64) -> Result<(), EvaluationError> {
        alert_service::delete_alert_rule(&self.pool, rule_id, user_id).await?;
        self.forget_rule(rule_id);
        Ok(())
    }

    /// Acknowledges an event, which closes it. The counter for its rule and
    /// machine starts over, so a breach that persists opens a new event.
    pub async fn acknowledge_event(
        &self,
        event_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<AlertEvent, EvaluationError> {
        let event = alert_service::acknowledge_alert_event(&self.pool, event_id, user_id, now).await?;

        let key = (event.rule_id, event.machine_id);
        let state = self.states.get(&key).map(|entry| entry.value().clone());
        if let Some(state) = state {
            let mut state = state.lock().await;
            if state.open_event_id == Some(event.id) {
                *state = RuleEvaluationState::default();
            }
        }

        info!(event_id, user_id, rule_id = event.rule_id, "Alert event acknowledged.");
        Ok(event)
    }

    pub fn tracked_states(&self) -> usize {
        self.states.len()
    }
}
