use chrono::{DateTime, Utc};

use crate::db::models::{AlertEvent, AlertRule, CreateAlertRule, UpdateAlertRule};
use crate::db::{DbError, DbPool};

fn validate_rule_fields(name: &str, metric: &str, threshold: f64, trigger_after: i64) -> Result<(), DbError> {
    if name.trim().is_empty() {
        return Err(DbError::InvalidInput("Rule name must not be empty".to_string()));
    }
    if metric.trim().is_empty() {
        return Err(DbError::InvalidInput("Metric must not be empty".to_string()));
    }
    if !threshold.is_finite() {
        return Err(DbError::InvalidInput("Threshold must be a finite number".to_string()));
    }
    if trigger_after < 1 {
        return Err(DbError::InvalidInput("trigger_after must be at least 1".to_string()));
    }
    Ok(())
}

pub async fn create_alert_rule(
    pool: &DbPool,
    user_id: i64,
    payload: CreateAlertRule,
) -> Result<AlertRule, DbError> {
    validate_rule_fields(&payload.name, &payload.metric, payload.threshold, payload.trigger_after)?;
    let now = Utc::now();

    let rule = sqlx::query_as::<_, AlertRule>(
        "INSERT INTO alert_rules (user_id, name, machine_id, metric, comparison, threshold, trigger_after, is_active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?) RETURNING *",
    )
    .bind(user_id)
    .bind(&payload.name)
    .bind(payload.machine_id)
    .bind(&payload.metric)
    .bind(payload.comparison.as_str())
    .bind(payload.threshold)
    .bind(payload.trigger_after)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(rule)
}

pub async fn get_alert_rule(pool: &DbPool, rule_id: i64, user_id: i64) -> Result<AlertRule, DbError> {
    sqlx::query_as::<_, AlertRule>("SELECT * FROM alert_rules WHERE id = ? AND user_id = ?")
        .bind(rule_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Alert rule with id {rule_id} not found")))
}

pub async fn get_alert_rules_for_user(pool: &DbPool, user_id: i64) -> Result<Vec<AlertRule>, DbError> {
    let rules = sqlx::query_as::<_, AlertRule>(
        "SELECT * FROM alert_rules WHERE user_id = ? ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rules)
}

/// Active rules of `user_id` watching `metric` that apply to `machine_id`,
/// either scoped to it or unscoped.
pub async fn get_active_rules_for_metric(
    pool: &DbPool,
    user_id: i64,
    metric: &str,
    machine_id: i64,
) -> Result<Vec<AlertRule>, DbError> {
    let rules = sqlx::query_as::<_, AlertRule>(
        "SELECT * FROM alert_rules
         WHERE user_id = ? AND metric = ? AND is_active = 1
           AND (machine_id IS NULL OR machine_id = ?)
         ORDER BY id",
    )
    .bind(user_id)
    .bind(metric)
    .bind(machine_id)
    .fetch_all(pool)
    .await?;
    Ok(rules)
}

pub async fn update_alert_rule(
    pool: &DbPool,
    rule_id: i64,
    user_id: i64,
    payload: UpdateAlertRule,
) -> Result<AlertRule, DbError> {
    let existing = get_alert_rule(pool, rule_id, user_id).await?;

    let name = payload.name.unwrap_or(existing.name);
    let machine_id = payload.machine_id.unwrap_or(existing.machine_id);
    let metric = payload.metric.unwrap_or(existing.metric);
    let comparison = payload.comparison.unwrap_or(existing.comparison);
    let threshold = payload.threshold.unwrap_or(existing.threshold);
    let trigger_after = payload.trigger_after.unwrap_or(existing.trigger_after);
    let is_active = payload.is_active.unwrap_or(existing.is_active);
    validate_rule_fields(&name, &metric, threshold, trigger_after)?;

    let rule = sqlx::query_as::<_, AlertRule>(
        "UPDATE alert_rules
         SET name = ?, machine_id = ?, metric = ?, comparison = ?, threshold = ?, trigger_after = ?, is_active = ?, updated_at = ?
         WHERE id = ? AND user_id = ?
         RETURNING *",
    )
    .bind(&name)
    .bind(machine_id)
    .bind(&metric)
    .bind(comparison.as_str())
    .bind(threshold)
    .bind(trigger_after)
    .bind(is_active)
    .bind(Utc::now())
    .bind(rule_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Alert rule with id {rule_id} not found")))?;

    Ok(rule)
}

pub async fn set_alert_rule_active(
    pool: &DbPool,
    rule_id: i64,
    user_id: i64,
    is_active: bool,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE alert_rules SET is_active = ?, updated_at = ? WHERE id = ? AND user_id = ?",
    )
    .bind(is_active)
    .bind(Utc::now())
    .bind(rule_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Alert rule with id {rule_id} not found")));
    }
    Ok(())
}

/// Deletes the rule only. Its events stay as history.
pub async fn delete_alert_rule(pool: &DbPool, rule_id: i64, user_id: i64) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM alert_rules WHERE id = ? AND user_id = ?")
        .bind(rule_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Alert rule with id {rule_id} not found")));
    }
    Ok(())
}

// --- Alert events ---

pub async fn get_open_event(
    pool: &DbPool,
    rule_id: i64,
    machine_id: i64,
) -> Result<Option<AlertEvent>, DbError> {
    let event = sqlx::query_as::<_, AlertEvent>(
        "SELECT * FROM alert_events
         WHERE rule_id = ? AND machine_id = ? AND resolved_at IS NULL AND acknowledged_at IS NULL",
    )
    .bind(rule_id)
    .bind(machine_id)
    .fetch_optional(pool)
    .await?;
    Ok(event)
}

/// Inserts a new open event. Fails with a unique-constraint error if one is
/// already open for the same rule and machine.
pub async fn create_alert_event(
    pool: &DbPool,
    rule_id: i64,
    machine_id: i64,
    value: f64,
    triggered_at: DateTime<Utc>,
) -> Result<AlertEvent, DbError> {
    let event = sqlx::query_as::<_, AlertEvent>(
        "INSERT INTO alert_events (rule_id, machine_id, value, triggered_at) VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(rule_id)
    .bind(machine_id)
    .bind(value)
    .bind(triggered_at)
    .fetch_one(pool)
    .await?;
    Ok(event)
}

/// Closes the event if it is still open. Returns `None` when it was already resolved.
pub async fn resolve_alert_event(
    pool: &DbPool,
    event_id: i64,
    resolved_at: DateTime<Utc>,
) -> Result<Option<AlertEvent>, DbError> {
    let event = sqlx::query_as::<_, AlertEvent>(
        "UPDATE alert_events SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL RETURNING *",
    )
    .bind(resolved_at)
    .bind(event_id)
    .fetch_optional(pool)
    .await?;
    Ok(event)
}

/// Sets `acknowledged_at` on an event whose rule belongs to `user_id`, which
/// closes it. Acknowledging twice keeps the first timestamp.
pub async fn acknowledge_alert_event(
    pool: &DbPool,
    event_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<AlertEvent, DbError> {
    let event = sqlx::query_as::<_, AlertEvent>(
        "UPDATE alert_events
         SET acknowledged_at = COALESCE(acknowledged_at, ?)
         WHERE id = ?
           AND rule_id IN (SELECT id FROM alert_rules WHERE user_id = ?)
         RETURNING *",
    )
    .bind(now)
    .bind(event_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Alert event with id {event_id} not found")))?;
    Ok(event)
}

pub async fn get_events_for_rule(pool: &DbPool, rule_id: i64) -> Result<Vec<AlertEvent>, DbError> {
    let events = sqlx::query_as::<_, AlertEvent>(
        "SELECT * FROM alert_events WHERE rule_id = ? ORDER BY triggered_at, id",
    )
    .bind(rule_id)
    .fetch_all(pool)
    .await?;
    Ok(events)
}
