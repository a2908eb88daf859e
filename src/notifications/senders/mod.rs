use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use super::models::{ChannelConfig, Notification};

pub mod telegram;
pub mod webhook;

/// Timeout for a single outbound HTTP request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SenderError {
    /// Configuration and payload errors fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SenderError::SendFailed(_) | SenderError::NetworkError(_))
    }
}

/// Delivers one notification to one recipient.
/// Implemented by every channel type (Telegram, Webhook).
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Performs a single delivery attempt. Retries are the caller's concern.
    ///
    /// * `config` - The decrypted configuration for this channel.
    /// * `notification` - What to deliver.
    async fn send(&self, config: &ChannelConfig, notification: &Notification) -> Result<(), SenderError>;
}

pub(crate) fn build_client() -> Result<reqwest::Client, SenderError> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

pub(crate) async fn ensure_success(response: reqwest::Response, target: &str) -> Result<(), SenderError> {
    let status = response.status();
    if !status.is_success() {
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        return Err(SenderError::SendFailed(format!(
            "{target} returned non-success status: {status}. Body: {error_body}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_retried() {
        assert!(!SenderError::InvalidConfiguration("x".into()).is_retryable());
        assert!(SenderError::SendFailed("503".into()).is_retryable());
    }
}
