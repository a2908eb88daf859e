use chrono::{DateTime, Utc};

use crate::db::models::{Machine, MachineStatus, OfflineNotificationMarker};
use crate::db::{DbError, DbPool};

pub async fn create_machine(pool: &DbPool, user_id: i64, name: &str) -> Result<Machine, DbError> {
    if name.trim().is_empty() {
        return Err(DbError::InvalidInput("Machine name must not be empty".to_string()));
    }
    let machine = sqlx::query_as::<_, Machine>(
        "INSERT INTO machines (user_id, name, status, created_at) VALUES (?, ?, 'online', ?) RETURNING *",
    )
    .bind(user_id)
    .bind(name)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(machine)
}

pub async fn get_machine(pool: &DbPool, machine_id: i64) -> Result<Machine, DbError> {
    sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE id = ?")
        .bind(machine_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Machine with id {machine_id} not found")))
}

pub async fn list_machines(pool: &DbPool) -> Result<Vec<Machine>, DbError> {
    let machines = sqlx::query_as::<_, Machine>("SELECT * FROM machines ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(machines)
}

/// Records a report from the machine. An out-of-order sample older than the
/// current `last_seen` leaves it unchanged.
pub async fn touch_last_seen(pool: &DbPool, machine_id: i64, seen_at: DateTime<Utc>) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE machines
         SET last_seen = CASE
             WHEN last_seen IS NULL OR julianday(?) > julianday(last_seen) THEN ?
             ELSE last_seen
         END
         WHERE id = ?",
    )
    .bind(seen_at)
    .bind(seen_at)
    .bind(machine_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Machine with id {machine_id} not found")));
    }
    Ok(())
}

/// Flips the status only if it still equals `expected`. Returns whether a row changed.
pub async fn set_status(
    pool: &DbPool,
    machine_id: i64,
    expected: MachineStatus,
    new_status: MachineStatus,
) -> Result<bool, DbError> {
    let result = sqlx::query("UPDATE machines SET status = ? WHERE id = ? AND status = ?")
        .bind(new_status.as_str())
        .bind(machine_id)
        .bind(expected.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Flips an online machine offline, but only if nothing reported since the
/// caller read `last_seen`. Returns whether a row changed.
pub async fn mark_offline_if_unseen_since(
    pool: &DbPool,
    machine_id: i64,
    last_seen: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE machines SET status = 'offline'
         WHERE id = ? AND status = 'online' AND last_seen = ?",
    )
    .bind(machine_id)
    .bind(last_seen)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

// --- Offline notification markers ---

pub async fn get_marker(pool: &DbPool, machine_id: i64) -> Result<Option<OfflineNotificationMarker>, DbError> {
    let marker = sqlx::query_as::<_, OfflineNotificationMarker>(
        "SELECT * FROM offline_notification_markers WHERE machine_id = ?",
    )
    .bind(machine_id)
    .fetch_optional(pool)
    .await?;
    Ok(marker)
}

/// Returns false when a marker already existed.
pub async fn create_marker(pool: &DbPool, machine_id: i64, notified_at: DateTime<Utc>) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO offline_notification_markers (machine_id, notified_at) VALUES (?, ?)
         ON CONFLICT (machine_id) DO NOTHING",
    )
    .bind(machine_id)
    .bind(notified_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_marker(pool: &DbPool, machine_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM offline_notification_markers WHERE machine_id = ?")
        .bind(machine_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
