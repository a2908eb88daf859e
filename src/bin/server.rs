use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nodenexus_alerting::db;
use nodenexus_alerting::notifications::dispatcher::NotificationDispatcher;
use nodenexus_alerting::notifications::encryption::EncryptionService;
use nodenexus_alerting::server::config::ServerConfig;
use nodenexus_alerting::server::heartbeat_monitor::HeartbeatMonitor;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "alertd.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let server_config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&server_config.log_dir);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting alerting daemon.");

    let pool = db::connect(&server_config.database_url).await?;

    let encryption = Arc::new(EncryptionService::from_hex(&server_config.notification_encryption_key)?);
    let dispatcher = Arc::new(NotificationDispatcher::with_default_senders(
        pool.clone(),
        encryption,
        server_config.telegram_bot_token.clone(),
        &server_config.telegram_api_base,
    )?);
    if server_config.telegram_bot_token.is_none() {
        info!("No Telegram bot token configured; Telegram channels will fail delivery.");
    }

    let cancel = CancellationToken::new();
    let monitor = Arc::new(HeartbeatMonitor::new(
        pool.clone(),
        dispatcher.clone(),
        server_config.heartbeat_config(),
    ));
    let monitor_handle = tokio::spawn(monitor.run(cancel.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received, stopping background tasks.");
    cancel.cancel();

    if let Err(e) = monitor_handle.await {
        error!(error = %e, "Heartbeat monitor task ended abnormally.");
    }
    pool.close().await;
    info!("Alerting daemon stopped.");
    Ok(())
}
