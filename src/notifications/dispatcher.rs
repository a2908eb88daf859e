//! Delivery policy shared by every channel: retry with exponential backoff,
//! a per-channel circuit breaker and a rate limit on test sends.
//!
//! Delivery failures never surface as errors. They are recorded on the channel
//! row and reported through [`DeliveryOutcome`]. Only persistence failures are
//! returned as [`DispatchError`].

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::models::{ChannelKind, NotificationChannel};
use crate::db::services::notification_service;
use crate::db::{DbError, DbPool};
use crate::notifications::encryption::EncryptionService;
use crate::notifications::models::{ChannelConfig, Notification};
use crate::notifications::senders::telegram::TelegramSender;
use crate::notifications::senders::webhook::WebhookSender;
use crate::notifications::senders::{NotificationSender, SenderError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] DbError),
}

/// Retry, breaker and rate-limit constants.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Attempts per dispatch, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry. Doubles on every further retry.
    pub base_backoff: Duration,
    /// Consecutive failed dispatches that open the breaker.
    pub failure_threshold: u32,
    pub cooldown: chrono::Duration,
    /// Minimum spacing between test sends on one channel.
    pub test_rate_limit: chrono::Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            failure_threshold: 3,
            cooldown: chrono::Duration::minutes(15),
            test_rate_limit: chrono::Duration::seconds(30),
        }
    }
}

impl DeliveryPolicy {
    /// Delay before retry number `retry` (1-based): 1s, 2s, 4s, ...
    pub fn backoff_before_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered {
        attempts: u32,
    },
    FailedFinal {
        attempts: u32,
        error: String,
        failure_count: i64,
        cooldown_until: Option<DateTime<Utc>>,
    },
    CircuitOpen {
        cooldown_until: DateTime<Utc>,
    },
    RateLimited,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::FailedFinal { .. } => "failed_final",
            DeliveryOutcome::CircuitOpen { .. } => "circuit_open",
            DeliveryOutcome::RateLimited => "rate_limited",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts } | DeliveryOutcome::FailedFinal { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::FailedFinal { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Per-channel results of a fan-out. A failed channel never hides the others.
#[derive(Debug, Default)]
pub struct FanOutSummary {
    pub outcomes: Vec<(i64, DeliveryOutcome)>,
    pub errors: Vec<(i64, DispatchError)>,
}

impl FanOutSummary {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_delivered()).count()
    }

    pub fn outcome_for(&self, channel_id: i64) -> Option<&DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == channel_id)
            .map(|(_, outcome)| outcome)
    }
}

pub struct NotificationDispatcher {
    pool: DbPool,
    encryption: Arc<EncryptionService>,
    senders: HashMap<ChannelKind, Arc<dyn NotificationSender>>,
    policy: DeliveryPolicy,
}

impl NotificationDispatcher {
    /// A dispatcher with no senders registered. Channels of an unregistered
    /// kind fail with a configuration error.
    pub fn new(pool: DbPool, encryption: Arc<EncryptionService>) -> Self {
        Self {
            pool,
            encryption,
            senders: HashMap::new(),
            policy: DeliveryPolicy::default(),
        }
    }

    /// Registers the HTTP webhook and Telegram senders.
    pub fn with_default_senders(
        pool: DbPool,
        encryption: Arc<EncryptionService>,
        telegram_bot_token: Option<String>,
        telegram_api_base: &str,
    ) -> Result<Self, SenderError> {
        Ok(Self::new(pool, encryption)
            .with_sender(ChannelKind::Webhook, Arc::new(WebhookSender::new()?))
            .with_sender(
                ChannelKind::Telegram,
                Arc::new(TelegramSender::new(telegram_bot_token, telegram_api_base)?),
            ))
    }

    pub fn with_sender(mut self, kind: ChannelKind, sender: Arc<dyn NotificationSender>) -> Self {
        self.senders.insert(kind, sender);
        self
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Delivers `notification` to one channel under the full policy.
    pub async fn send(
        &self,
        channel: &NotificationChannel,
        notification: &Notification,
    ) -> Result<DeliveryOutcome, DispatchError> {
        self.dispatch(channel, notification, false).await
    }

    /// Sends a test message to one of the user's channels. Rate limited per channel.
    pub async fn send_test(
        &self,
        user_id: i64,
        channel_id: i64,
        message: &str,
    ) -> Result<DeliveryOutcome, DispatchError> {
        let channel = notification_service::get_channel(&self.pool, channel_id, user_id).await?;
        let notification = Notification::test(message, Utc::now());
        self.dispatch(&channel, &notification, true).await
    }

    /// Sends to every active channel of `user_id` concurrently.
    pub async fn fan_out(
        &self,
        user_id: i64,
        notification: &Notification,
    ) -> Result<FanOutSummary, DispatchError> {
        let channels = notification_service::get_active_channels_for_user(&self.pool, user_id).await?;
        if channels.is_empty() {
            debug!(user_id, kind = %notification.kind, "No active notification channels for user.");
            return Ok(FanOutSummary::default());
        }

        let results = join_all(
            channels
                .iter()
                .map(|channel| async move { (channel.id, self.send(channel, notification).await) }),
        )
        .await;

        let mut summary = FanOutSummary::default();
        for (channel_id, result) in results {
            match result {
                Ok(outcome) => summary.outcomes.push((channel_id, outcome)),
                Err(e) => {
                    error!(channel_id, error = %e, "Failed to record notification dispatch.");
                    summary.errors.push((channel_id, e));
                }
            }
        }

        info!(
            user_id,
            kind = %notification.kind,
            channels = channels.len(),
            delivered = summary.delivered(),
            "Notification fan-out finished."
        );
        Ok(summary)
    }

    async fn dispatch(
        &self,
        channel: &NotificationChannel,
        notification: &Notification,
        rate_limited: bool,
    ) -> Result<DeliveryOutcome, DispatchError> {
        let now = Utc::now();

        if rate_limited && channel.attempted_within(now, self.policy.test_rate_limit) {
            info!(channel_id = channel.id, "Test send rejected by rate limit.");
            let outcome = DeliveryOutcome::RateLimited;
            self.write_log(channel.id, notification, &outcome).await;
            return Ok(outcome);
        }

        if let Some(cooldown_until) = channel.cooldown_until.filter(|_| channel.is_circuit_open(now)) {
            info!(
                channel_id = channel.id,
                %cooldown_until,
                "Circuit open for channel, skipping delivery."
            );
            let outcome = DeliveryOutcome::CircuitOpen { cooldown_until };
            self.write_log(channel.id, notification, &outcome).await;
            return Ok(outcome);
        }

        let (attempts, result) = match self.resolve(channel) {
            Ok((sender, config)) => self.deliver_with_retry(channel.id, sender.as_ref(), &config, notification).await,
            Err(e) => (0, Err(e)),
        };

        let finished_at = Utc::now();
        let outcome = match result {
            Ok(()) => {
                notification_service::record_delivery_success(&self.pool, channel.id, finished_at).await?;
                info!(channel_id = channel.id, kind = %notification.kind, attempts, "Notification delivered.");
                DeliveryOutcome::Delivered { attempts }
            }
            Err(e) => {
                let message = e.to_string();
                let (failure_count, cooldown_until) = notification_service::record_delivery_failure(
                    &self.pool,
                    channel.id,
                    finished_at,
                    &message,
                    self.policy.failure_threshold,
                    finished_at + self.policy.cooldown,
                )
                .await?;
                if let Some(until) = cooldown_until {
                    warn!(
                        channel_id = channel.id,
                        failure_count,
                        cooldown_until = %until,
                        "Channel failure threshold reached, opening circuit."
                    );
                }
                error!(
                    channel_id = channel.id,
                    kind = %notification.kind,
                    attempts,
                    failure_count,
                    error = %message,
                    "Notification delivery failed after all attempts."
                );
                DeliveryOutcome::FailedFinal {
                    attempts,
                    error: message,
                    failure_count,
                    cooldown_until,
                }
            }
        };

        self.write_log(channel.id, notification, &outcome).await;
        Ok(outcome)
    }

    fn resolve(
        &self,
        channel: &NotificationChannel,
    ) -> Result<(Arc<dyn NotificationSender>, ChannelConfig), SenderError> {
        let sender = self.senders.get(&channel.kind).cloned().ok_or_else(|| {
            SenderError::InvalidConfiguration(format!("No sender registered for channel kind '{}'", channel.kind))
        })?;

        let config = match channel.kind {
            ChannelKind::Webhook => {
                let secret = notification_service::decrypt_channel_secret(&self.encryption, channel)
                    .map_err(|e| SenderError::InvalidConfiguration(format!("Cannot read webhook secret: {e}")))?
                    .ok_or_else(|| {
                        SenderError::InvalidConfiguration("Webhook channel has no signing secret".to_string())
                    })?;
                ChannelConfig::Webhook {
                    url: channel.destination.clone(),
                    secret,
                }
            }
            ChannelKind::Telegram => ChannelConfig::Telegram {
                chat_id: channel.destination.clone(),
            },
        };
        Ok((sender, config))
    }

    async fn deliver_with_retry(
        &self,
        channel_id: i64,
        sender: &dyn NotificationSender,
        config: &ChannelConfig,
        notification: &Notification,
    ) -> (u32, Result<(), SenderError>) {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match sender.send(config, notification).await {
                Ok(()) => return (attempts, Ok(())),
                Err(e) if !e.is_retryable() || attempts >= max_attempts => return (attempts, Err(e)),
                Err(e) => {
                    let delay = self.policy.backoff_before_retry(attempts);
                    warn!(
                        channel_id,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Notification attempt failed, retrying."
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// The log is informational; failing to write it only warns.
    async fn write_log(&self, channel_id: i64, notification: &Notification, outcome: &DeliveryOutcome) {
        if let Err(e) = notification_service::insert_notification_log(
            &self.pool,
            channel_id,
            notification.kind.as_str(),
            outcome.as_str(),
            outcome.attempts(),
            outcome.error(),
        )
        .await
        {
            warn!(channel_id, error = %e, "Failed to write notification log.");
        }
    }
}
