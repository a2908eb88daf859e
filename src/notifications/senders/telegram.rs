use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{build_client, ensure_success, NotificationSender, SenderError};
use crate::notifications::models::{ChannelConfig, Notification};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Sends notifications through the Telegram Bot API with a bot token shared by
/// all Telegram channels.
pub struct TelegramSender {
    client: Client,
    bot_token: Option<String>,
    api_base: String,
}

impl TelegramSender {
    pub fn new(bot_token: Option<String>, api_base: impl Into<String>) -> Result<Self, SenderError> {
        Ok(Self::with_client(build_client()?, bot_token, api_base))
    }

    pub fn with_client(client: Client, bot_token: Option<String>, api_base: impl Into<String>) -> Self {
        Self {
            client,
            bot_token: bot_token.filter(|t| !t.trim().is_empty()),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Escapes text for Telegram MarkdownV2.
/// Characters to escape: \ _ * [ ] ( ) ~ ` > # + - = | { } . !
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped_text = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|' | '{'
                | '}' | '.' | '!'
        ) {
            escaped_text.push('\\');
        }
        escaped_text.push(c);
    }
    escaped_text
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[async_trait]
impl NotificationSender for TelegramSender {
    async fn send(&self, config: &ChannelConfig, notification: &Notification) -> Result<(), SenderError> {
        let chat_id = match config {
            ChannelConfig::Telegram { chat_id } => chat_id,
            _ => {
                return Err(SenderError::InvalidConfiguration(
                    "Expected Telegram config, but found a different type.".to_string(),
                ));
            }
        };
        let bot_token = self.bot_token.as_deref().ok_or_else(|| {
            SenderError::InvalidConfiguration("Telegram bot token is not configured".to_string())
        })?;

        let api_url = format!("{}/bot{bot_token}/sendMessage", self.api_base);
        let escaped_message = escape_markdown_v2(&notification.message);
        let payload = TelegramMessage {
            chat_id,
            text: &escaped_message,
            parse_mode: "MarkdownV2",
        };

        let response = self.client.post(&api_url).json(&payload).send().await?;
        ensure_success(response, "Telegram API").await
    }
}
