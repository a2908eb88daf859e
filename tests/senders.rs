mod common;

use axum::http::StatusCode;
use chrono::Utc;
use std::sync::Arc;

use common::*;
use nodenexus_alerting::db::models::ChannelKind;
use nodenexus_alerting::notifications::dispatcher::{DeliveryOutcome, NotificationDispatcher};
use nodenexus_alerting::notifications::models::{ChannelConfig, Notification};
use nodenexus_alerting::notifications::senders::telegram::TelegramSender;
use nodenexus_alerting::notifications::senders::webhook::WebhookSender;
use nodenexus_alerting::notifications::senders::{NotificationSender, SenderError};
use nodenexus_alerting::notifications::signing::{verify_signature, EVENT_HEADER, SIGNATURE_HEADER};

#[tokio::test]
async fn webhook_body_is_signed_with_the_channel_secret() {
    let receiver = spawn_receiver(StatusCode::OK).await;
    let sender = WebhookSender::with_client(local_client());
    let config = ChannelConfig::Webhook {
        url: format!("{}/hooks/alerts", receiver.base_url),
        secret: WEBHOOK_SECRET.to_string(),
    };

    sender
        .send(&config, &Notification::test("ping", Utc::now()))
        .await
        .unwrap();

    let requests = receiver.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.path, "/hooks/alerts");
    assert_eq!(request.headers[EVENT_HEADER], "notification.test");
    assert_eq!(request.headers["content-type"], "application/json");

    let signature = request.headers[SIGNATURE_HEADER].to_str().unwrap();
    assert!(verify_signature(WEBHOOK_SECRET.as_bytes(), &request.body, signature));
    assert!(!verify_signature(b"some-other-secret", &request.body, signature));

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], "notification.test");
    assert_eq!(body["message"], "ping");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn webhook_non_success_status_is_a_send_failure() {
    let receiver = spawn_receiver(StatusCode::SERVICE_UNAVAILABLE).await;
    let sender = WebhookSender::with_client(local_client());
    let config = ChannelConfig::Webhook {
        url: receiver.base_url.clone(),
        secret: WEBHOOK_SECRET.to_string(),
    };

    let err = sender
        .send(&config, &Notification::test("ping", Utc::now()))
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::SendFailed(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn webhook_rejects_telegram_config() {
    let sender = WebhookSender::with_client(local_client());
    let err = sender
        .send(
            &ChannelConfig::Telegram { chat_id: "1".to_string() },
            &Notification::test("ping", Utc::now()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SenderError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn telegram_posts_escaped_markdown_to_bot_endpoint() {
    let receiver = spawn_receiver(StatusCode::OK).await;
    let sender = TelegramSender::with_client(local_client(), Some("123:abc".to_string()), &receiver.base_url);
    let config = ChannelConfig::Telegram {
        chat_id: "-100200300".to_string(),
    };

    sender
        .send(&config, &Notification::test("cpu_pct = 87.5!", Utc::now()))
        .await
        .unwrap();

    let requests = receiver.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/bot123:abc/sendMessage");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["chat_id"], "-100200300");
    assert_eq!(body["parse_mode"], "MarkdownV2");
    assert_eq!(body["text"], "cpu\\_pct \\= 87\\.5\\!");
}

#[tokio::test]
async fn dispatcher_retries_a_failing_webhook_endpoint() {
    let pool = setup_db().await;
    let receiver = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let dispatcher = NotificationDispatcher::new(pool.clone(), encryption())
        .with_sender(ChannelKind::Webhook, Arc::new(WebhookSender::with_client(local_client())))
        .with_policy(instant_policy());
    let channel = create_webhook_channel(&pool, 1, &format!("{}/hook", receiver.base_url)).await;

    let outcome = dispatcher
        .send(&channel, &Notification::test("ping", Utc::now()))
        .await
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::FailedFinal { attempts: 3, .. }));
    assert_eq!(receiver.requests().len(), 3);

    receiver.set_status(StatusCode::NO_CONTENT);
    let channel = reload_channel(&pool, &channel).await;
    let outcome = dispatcher
        .send(&channel, &Notification::test("ping", Utc::now()))
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });

    // The decrypted secret signs the body.
    let last = receiver.requests().pop().unwrap();
    let signature = last.headers[SIGNATURE_HEADER].to_str().unwrap();
    assert!(verify_signature(WEBHOOK_SECRET.as_bytes(), &last.body, signature));
}
