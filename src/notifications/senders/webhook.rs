use async_trait::async_trait;
use reqwest::{header, Client};

use super::{build_client, ensure_success, NotificationSender, SenderError};
use crate::notifications::models::{ChannelConfig, Notification};
use crate::notifications::signing::{signature_header_value, EVENT_HEADER, SIGNATURE_HEADER};

/// Posts the notification as signed JSON to a webhook URL.
pub struct WebhookSender {
    client: Client,
}

impl WebhookSender {
    pub fn new() -> Result<Self, SenderError> {
        Ok(Self::with_client(build_client()?))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, config: &ChannelConfig, notification: &Notification) -> Result<(), SenderError> {
        let (url, secret) = match config {
            ChannelConfig::Webhook { url, secret } => (url, secret),
            _ => {
                return Err(SenderError::InvalidConfiguration(
                    "Expected Webhook config, but found a different type.".to_string(),
                ));
            }
        };

        // The signature covers the exact bytes sent.
        let body = notification.body()?;
        let signature = signature_header_value(secret.as_bytes(), &body);

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, notification.kind.as_str())
            .body(body)
            .send()
            .await?;

        ensure_success(response, "Webhook").await
    }
}
