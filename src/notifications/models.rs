use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::db::models::{AlertEvent, AlertRule, Machine};

/// Kind of event a notification announces. Serialized into the `event` field
/// of webhook bodies and the `X-NodeNexus-Event` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "alert.triggered")]
    AlertTriggered,
    #[serde(rename = "machine.offline")]
    MachineOffline,
    #[serde(rename = "machine.online")]
    MachineOnline,
    #[serde(rename = "notification.test")]
    Test,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::AlertTriggered => "alert.triggered",
            NotificationKind::MachineOffline => "machine.offline",
            NotificationKind::MachineOnline => "machine.online",
            NotificationKind::Test => "notification.test",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel-agnostic notification: a structured snapshot for webhooks plus a
/// preformatted human-readable message for chat channels.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
    pub message: String,
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Notification {
    pub fn alert_triggered(rule: &AlertRule, event: &AlertEvent, machine_name: &str) -> Self {
        let message = format!(
            "🚨 Alert '{}' triggered on {}: {} = {} ({} {})",
            rule.name,
            machine_name,
            rule.metric,
            event.value,
            rule.comparison,
            rule.threshold
        );
        let payload = json!({
            "event_id": event.id,
            "rule_id": rule.id,
            "rule_name": rule.name,
            "machine_id": event.machine_id,
            "machine_name": machine_name,
            "metric": rule.metric,
            "comparison": rule.comparison,
            "threshold": rule.threshold,
            "trigger_after": rule.trigger_after,
            "value": event.value,
            "triggered_at": event.triggered_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        Self {
            kind: NotificationKind::AlertTriggered,
            timestamp: event.triggered_at,
            payload: into_map(payload),
            message,
        }
    }

    pub fn machine_offline(machine: &Machine, now: DateTime<Utc>) -> Self {
        let last_seen = machine
            .last_seen
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));
        let message = format!(
            "🔴 Machine '{}' is offline. Last seen: {}",
            machine.name,
            last_seen.as_deref().unwrap_or("never")
        );
        let payload = json!({
            "machine_id": machine.id,
            "machine_name": machine.name,
            "status": "offline",
            "last_seen": last_seen,
        });
        Self {
            kind: NotificationKind::MachineOffline,
            timestamp: now,
            payload: into_map(payload),
            message,
        }
    }

    pub fn machine_online(machine: &Machine, now: DateTime<Utc>) -> Self {
        let message = format!("🟢 Machine '{}' is back online.", machine.name);
        let payload = json!({
            "machine_id": machine.id,
            "machine_name": machine.name,
            "status": "online",
            "last_seen": machine.last_seen.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        });
        Self {
            kind: NotificationKind::MachineOnline,
            timestamp: now,
            payload: into_map(payload),
            message,
        }
    }

    pub fn test(message: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind: NotificationKind::Test,
            timestamp: now,
            payload: into_map(json!({ "message": message })),
            message: message.to_string(),
        }
    }

    /// JSON body for webhooks: `event` and `timestamp` followed by the snapshot fields.
    pub fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut body = Map::with_capacity(self.payload.len() + 2);
        body.insert("event".to_string(), Value::from(self.kind.as_str()));
        body.insert(
            "timestamp".to_string(),
            Value::from(self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        for (key, value) in &self.payload {
            if key != "event" && key != "timestamp" {
                body.insert(key.clone(), value.clone());
            }
        }
        serde_json::to_vec(&Value::Object(body))
    }
}

/// Decrypted per-delivery configuration handed to a sender.
#[derive(Debug, Clone)]
pub enum ChannelConfig {
    Webhook { url: String, secret: String },
    Telegram { chat_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn body_puts_event_and_timestamp_first_class() {
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let notification = Notification::test("hello", now);
        let body: Value = serde_json::from_slice(&notification.body().unwrap()).unwrap();

        assert_eq!(body["event"], "notification.test");
        assert_eq!(body["timestamp"], "2025-08-01T12:00:00Z");
        assert_eq!(body["message"], "hello");
    }

    #[test]
    fn kind_serializes_to_dotted_name() {
        let json = serde_json::to_string(&NotificationKind::MachineOffline).unwrap();
        assert_eq!(json, "\"machine.offline\"");
        assert_eq!(NotificationKind::AlertTriggered.to_string(), "alert.triggered");
    }
}
