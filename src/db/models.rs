use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} value: '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum_conversions {
    ($ty:ty) => {
        impl TryFrom<String> for $ty {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Direction in which an alert rule compares samples against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Above,
    Below,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Above => "above",
            Comparison::Below => "below",
        }
    }

    /// Returns true when `value` breaches `threshold`. Both bounds are inclusive.
    /// Non-finite samples never breach.
    pub fn is_breached(&self, value: f64, threshold: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            Comparison::Above => value >= threshold,
            Comparison::Below => value <= threshold,
        }
    }
}

impl FromStr for Comparison {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "above" | ">=" => Ok(Comparison::Above),
            "below" | "<=" => Ok(Comparison::Below),
            _ => Err(UnknownVariant {
                kind: "comparison",
                value: s.to_string(),
            }),
        }
    }
}

text_enum_conversions!(Comparison);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
    Telegram,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Webhook => "webhook",
            ChannelKind::Telegram => "telegram",
        }
    }
}

impl FromStr for ChannelKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(ChannelKind::Webhook),
            "telegram" => Ok(ChannelKind::Telegram),
            _ => Err(UnknownVariant {
                kind: "channel kind",
                value: s.to_string(),
            }),
        }
    }
}

text_enum_conversions!(ChannelKind);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Offline,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Online => "online",
            MachineStatus::Offline => "offline",
        }
    }
}

impl FromStr for MachineStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(MachineStatus::Online),
            "offline" => Ok(MachineStatus::Offline),
            _ => Err(UnknownVariant {
                kind: "machine status",
                value: s.to_string(),
            }),
        }
    }
}

text_enum_conversions!(MachineStatus);

/// Represents a threshold rule owned by a user.
/// Corresponds to the `alert_rules` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AlertRule {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub machine_id: Option<i64>, // None applies the rule to every machine of the user
    pub metric: String,
    #[sqlx(try_from = "String")]
    pub comparison: Comparison,
    pub threshold: f64,
    pub trigger_after: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    /// Number of consecutive breaches needed to open an event, never less than one.
    pub fn required_breaches(&self) -> u32 {
        self.trigger_after.clamp(1, u32::MAX as i64) as u32
    }
}

/// Represents one firing of an alert rule on a machine.
/// Corresponds to the `alert_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AlertEvent {
    pub id: i64,
    pub rule_id: i64,
    pub machine_id: i64,
    pub value: f64,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlertEvent {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none() && self.acknowledged_at.is_none()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}

/// Represents a delivery destination together with its delivery health.
/// Corresponds to the `notification_channels` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationChannel {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub kind: ChannelKind,
    pub destination: String, // webhook URL or Telegram chat id
    #[serde(skip)]
    pub secret_ciphertext: Option<Vec<u8>>, // AES-GCM encrypted HMAC key, webhooks only
    pub secret_hint: Option<String>,
    pub is_active: bool,
    pub failure_count: i64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationChannel {
    /// The breaker is open while `cooldown_until` lies in the future.
    pub fn is_circuit_open(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// True when the previous attempt happened less than `window` ago.
    pub fn attempted_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_attempt_at
            .is_some_and(|last| now.signed_duration_since(last) < window)
    }
}

/// Represents a monitored host.
/// Corresponds to the `machines` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Machine {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub status: MachineStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Present while a machine is offline and its owner has been told so.
/// Corresponds to the `offline_notification_markers` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OfflineNotificationMarker {
    pub machine_id: i64,
    pub notified_at: DateTime<Utc>,
}

/// One dispatch as recorded by the notification dispatcher.
/// Corresponds to the `notification_logs` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationLog {
    pub id: i64,
    pub channel_id: i64,
    pub event_kind: String,
    pub outcome: String,
    pub attempts: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAlertRule {
    pub name: String,
    pub machine_id: Option<i64>,
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub trigger_after: i64,
}

/// Input for updating an alert rule. `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAlertRule {
    pub name: Option<String>,
    pub machine_id: Option<Option<i64>>,
    pub metric: Option<String>,
    pub comparison: Option<Comparison>,
    pub threshold: Option<f64>,
    pub trigger_after: Option<i64>,
    pub is_active: Option<bool>,
}

/// Input for creating a notification channel. `secret` is the plain HMAC key
/// and is required for webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub destination: String,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateChannel {
    pub name: Option<String>,
    pub destination: Option<String>,
    pub secret: Option<String>,
    pub is_active: Option<bool>,
}
