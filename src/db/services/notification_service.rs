use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::db::models::{ChannelKind, CreateChannel, NotificationChannel, NotificationLog, UpdateChannel};
use crate::db::{DbError, DbPool};
use crate::notifications::encryption::EncryptionService;

const MIN_SECRET_LEN: usize = 8;

fn validate_destination(kind: ChannelKind, destination: &str) -> Result<(), DbError> {
    match kind {
        ChannelKind::Webhook => {
            let url = Url::parse(destination)
                .map_err(|e| DbError::InvalidInput(format!("Invalid webhook URL '{destination}': {e}")))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(DbError::InvalidInput(format!(
                    "Webhook URL must use http or https, got '{}'",
                    url.scheme()
                )));
            }
        }
        ChannelKind::Telegram => {
            if destination.trim().is_empty() {
                return Err(DbError::InvalidInput("Telegram chat id must not be empty".to_string()));
            }
        }
    }
    Ok(())
}

fn secret_hint(secret: &str) -> String {
    let tail: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{tail}")
}

fn seal_secret(
    encryption: &EncryptionService,
    secret: &str,
) -> Result<(Vec<u8>, String), DbError> {
    if secret.chars().count() < MIN_SECRET_LEN {
        return Err(DbError::InvalidInput(format!(
            "Webhook secret must be at least {MIN_SECRET_LEN} characters"
        )));
    }
    let ciphertext = encryption.encrypt(secret.as_bytes())?;
    Ok((ciphertext, secret_hint(secret)))
}

pub async fn create_channel(
    pool: &DbPool,
    encryption: &EncryptionService,
    user_id: i64,
    payload: CreateChannel,
) -> Result<NotificationChannel, DbError> {
    if payload.name.trim().is_empty() {
        return Err(DbError::InvalidInput("Channel name must not be empty".to_string()));
    }
    validate_destination(payload.kind, &payload.destination)?;

    let (ciphertext, hint) = match (payload.kind, payload.secret.as_deref()) {
        (ChannelKind::Webhook, Some(secret)) => {
            let (c, h) = seal_secret(encryption, secret)?;
            (Some(c), Some(h))
        }
        (ChannelKind::Webhook, None) => {
            return Err(DbError::InvalidInput("Webhook channels require a signing secret".to_string()));
        }
        (ChannelKind::Telegram, _) => (None, None),
    };

    let now = Utc::now();
    let channel = sqlx::query_as::<_, NotificationChannel>(
        "INSERT INTO notification_channels (user_id, name, kind, destination, secret_ciphertext, secret_hint, is_active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?) RETURNING *",
    )
    .bind(user_id)
    .bind(&payload.name)
    .bind(payload.kind.as_str())
    .bind(&payload.destination)
    .bind(ciphertext)
    .bind(hint)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(channel)
}

pub async fn get_channel(pool: &DbPool, channel_id: i64, user_id: i64) -> Result<NotificationChannel, DbError> {
    sqlx::query_as::<_, NotificationChannel>(
        "SELECT * FROM notification_channels WHERE id = ? AND user_id = ?",
    )
    .bind(channel_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Notification channel with id {channel_id} not found")))
}

pub async fn get_channels_for_user(pool: &DbPool, user_id: i64) -> Result<Vec<NotificationChannel>, DbError> {
    let channels = sqlx::query_as::<_, NotificationChannel>(
        "SELECT * FROM notification_channels WHERE user_id = ? ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(channels)
}

pub async fn get_active_channels_for_user(
    pool: &DbPool,
    user_id: i64,
) -> Result<Vec<NotificationChannel>, DbError> {
    let channels = sqlx::query_as::<_, NotificationChannel>(
        "SELECT * FROM notification_channels WHERE user_id = ? AND is_active = 1 ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(channels)
}

pub async fn update_channel(
    pool: &DbPool,
    encryption: &EncryptionService,
    channel_id: i64,
    user_id: i64,
    payload: UpdateChannel,
) -> Result<NotificationChannel, DbError> {
    let existing = get_channel(pool, channel_id, user_id).await?;

    let name = payload.name.unwrap_or(existing.name);
    if name.trim().is_empty() {
        return Err(DbError::InvalidInput("Channel name must not be empty".to_string()));
    }
    let destination = payload.destination.unwrap_or(existing.destination);
    validate_destination(existing.kind, &destination)?;
    let is_active = payload.is_active.unwrap_or(existing.is_active);

    let (ciphertext, hint) = match (existing.kind, payload.secret.as_deref()) {
        (ChannelKind::Webhook, Some(secret)) => {
            let (c, h) = seal_secret(encryption, secret)?;
            (Some(c), Some(h))
        }
        _ => (existing.secret_ciphertext, existing.secret_hint),
    };

    let channel = sqlx::query_as::<_, NotificationChannel>(
        "UPDATE notification_channels
         SET name = ?, destination = ?, secret_ciphertext = ?, secret_hint = ?, is_active = ?, updated_at = ?
         WHERE id = ? AND user_id = ?
         RETURNING *",
    )
    .bind(&name)
    .bind(&destination)
    .bind(ciphertext)
    .bind(hint)
    .bind(is_active)
    .bind(Utc::now())
    .bind(channel_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Notification channel with id {channel_id} not found")))?;

    Ok(channel)
}

pub async fn delete_channel(pool: &DbPool, channel_id: i64, user_id: i64) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM notification_channels WHERE id = ? AND user_id = ?")
        .bind(channel_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Notification channel with id {channel_id} not found")));
    }
    Ok(())
}

/// Returns the plain webhook signing secret, or `None` for channels without one.
pub fn decrypt_channel_secret(
    encryption: &EncryptionService,
    channel: &NotificationChannel,
) -> Result<Option<String>, DbError> {
    match &channel.secret_ciphertext {
        Some(ciphertext) => Ok(Some(encryption.decrypt_to_string(ciphertext)?)),
        None => Ok(None),
    }
}

pub async fn record_delivery_success(
    pool: &DbPool,
    channel_id: i64,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE notification_channels
         SET failure_count = 0, cooldown_until = NULL, last_success_at = ?, last_attempt_at = ?
         WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(channel_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Counts one failed dispatch in a single statement and opens the breaker once
/// the count reaches `failure_threshold`. Returns the new count and cooldown.
pub async fn record_delivery_failure(
    pool: &DbPool,
    channel_id: i64,
    now: DateTime<Utc>,
    error: &str,
    failure_threshold: u32,
    cooldown_until: DateTime<Utc>,
) -> Result<(i64, Option<DateTime<Utc>>), DbError> {
    let row: (i64, Option<DateTime<Utc>>) = sqlx::query_as(
        "UPDATE notification_channels
         SET failure_count = failure_count + 1,
             last_error_at = ?,
             last_attempt_at = ?,
             last_error = ?,
             cooldown_until = CASE WHEN failure_count + 1 >= ? THEN ? ELSE NULL END
         WHERE id = ?
         RETURNING failure_count, cooldown_until",
    )
    .bind(now)
    .bind(now)
    .bind(error)
    .bind(i64::from(failure_threshold))
    .bind(cooldown_until)
    .bind(channel_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DbError::NotFound(format!("Notification channel with id {channel_id} not found")))?;
    Ok(row)
}

pub async fn insert_notification_log(
    pool: &DbPool,
    channel_id: i64,
    event_kind: &str,
    outcome: &str,
    attempts: u32,
    error: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO notification_logs (channel_id, event_kind, outcome, attempts, error, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(channel_id)
    .bind(event_kind)
    .bind(outcome)
    .bind(i64::from(attempts))
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent log rows first.
pub async fn get_notification_logs(
    pool: &DbPool,
    channel_id: i64,
    limit: i64,
) -> Result<Vec<NotificationLog>, DbError> {
    let logs = sqlx::query_as::<_, NotificationLog>(
        "SELECT * FROM notification_logs WHERE channel_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(channel_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(logs)
}
