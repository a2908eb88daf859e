#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodenexus_alerting::db::models::{ChannelKind, CreateChannel, Machine, NotificationChannel};
use nodenexus_alerting::db::services::{machine_service, notification_service};
use nodenexus_alerting::db::{self, DbPool};
use nodenexus_alerting::notifications::dispatcher::{DeliveryPolicy, NotificationDispatcher};
use nodenexus_alerting::notifications::encryption::EncryptionService;
use nodenexus_alerting::notifications::models::{ChannelConfig, Notification, NotificationKind};
use nodenexus_alerting::notifications::senders::{NotificationSender, SenderError};

pub const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
pub const WEBHOOK_SECRET: &str = "whsec-test-signing-key";

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap()
}

pub async fn setup_db() -> DbPool {
    db::connect_in_memory().await.expect("in-memory database")
}

pub fn encryption() -> Arc<EncryptionService> {
    Arc::new(EncryptionService::from_hex(KEY_HEX).unwrap())
}

/// No backoff between retries.
pub fn instant_policy() -> DeliveryPolicy {
    DeliveryPolicy {
        base_backoff: Duration::ZERO,
        ..DeliveryPolicy::default()
    }
}

/// Fake sender that replays a script of results, then falls back to a fixed result.
pub struct ScriptedSender {
    script: Mutex<VecDeque<Result<(), String>>>,
    fallback: Result<(), String>,
    calls: AtomicUsize,
    kinds: Mutex<Vec<NotificationKind>>,
}

impl ScriptedSender {
    pub fn scripted(script: Vec<Result<(), String>>, fallback: Result<(), String>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            kinds: Mutex::new(Vec::new()),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::scripted(Vec::new(), Ok(()))
    }

    pub fn always_failing() -> Arc<Self> {
        Self::scripted(Vec::new(), Err("endpoint returned 503".to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.kinds.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for ScriptedSender {
    async fn send(&self, _config: &ChannelConfig, notification: &Notification) -> Result<(), SenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(notification.kind);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(SenderError::SendFailed)
    }
}

pub fn dispatcher_with(pool: &DbPool, sender: Arc<ScriptedSender>) -> Arc<NotificationDispatcher> {
    Arc::new(
        NotificationDispatcher::new(pool.clone(), encryption())
            .with_sender(ChannelKind::Webhook, sender.clone())
            .with_sender(ChannelKind::Telegram, sender)
            .with_policy(instant_policy()),
    )
}

pub async fn create_webhook_channel(pool: &DbPool, user_id: i64, url: &str) -> NotificationChannel {
    notification_service::create_channel(
        pool,
        &encryption(),
        user_id,
        CreateChannel {
            name: "ops webhook".to_string(),
            kind: ChannelKind::Webhook,
            destination: url.to_string(),
            secret: Some(WEBHOOK_SECRET.to_string()),
        },
    )
    .await
    .unwrap()
}

pub async fn create_telegram_channel(pool: &DbPool, user_id: i64, chat_id: &str) -> NotificationChannel {
    notification_service::create_channel(
        pool,
        &encryption(),
        user_id,
        CreateChannel {
            name: "ops chat".to_string(),
            kind: ChannelKind::Telegram,
            destination: chat_id.to_string(),
            secret: None,
        },
    )
    .await
    .unwrap()
}

pub async fn reload_channel(pool: &DbPool, channel: &NotificationChannel) -> NotificationChannel {
    notification_service::get_channel(pool, channel.id, channel.user_id)
        .await
        .unwrap()
}

pub async fn create_machine_seen_at(pool: &DbPool, user_id: i64, name: &str, seen: DateTime<Utc>) -> Machine {
    let machine = machine_service::create_machine(pool, user_id, name).await.unwrap();
    machine_service::touch_last_seen(pool, machine.id, seen).await.unwrap();
    machine_service::get_machine(pool, machine.id).await.unwrap()
}

// --- Local HTTP receiver ---

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Clone)]
struct ReceiverState {
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    status: Arc<AtomicU16>,
}

pub struct Receiver {
    pub base_url: String,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    status: Arc<AtomicU16>,
}

impl Receiver {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }

    pub fn set_status(&self, status: StatusCode) {
        self.status.store(status.as_u16(), Ordering::SeqCst);
    }
}

async fn capture(State(state): State<ReceiverState>, uri: Uri, headers: HeaderMap, body: Bytes) -> StatusCode {
    state.captured.lock().unwrap().push(CapturedRequest {
        path: uri.path().to_string(),
        headers,
        body: body.to_vec(),
    });
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Starts an HTTP server on an ephemeral port that records every request and
/// answers with the configured status.
pub async fn spawn_receiver(status: StatusCode) -> Receiver {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let status = Arc::new(AtomicU16::new(status.as_u16()));
    let state = ReceiverState {
        captured: captured.clone(),
        status: status.clone(),
    };
    let app = Router::new().fallback(capture).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Receiver {
        base_url: format!("http://{addr}"),
        captured,
        status,
    }
}

pub fn local_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}
