use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::heartbeat_monitor::HeartbeatConfig;
use crate::notifications::senders::telegram::DEFAULT_API_BASE;

const MAX_OFFLINE_THRESHOLD_SECS: u64 = 7 * 24 * 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub log_dir: String,
    pub notification_encryption_key: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub heartbeat_interval_seconds: u64,
    pub offline_threshold_seconds: u64,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    database_url: Option<String>,
    log_dir: Option<String>,
    notification_encryption_key: Option<String>,
    telegram_bot_token: Option<String>,
    telegram_api_base: Option<String>,
    heartbeat_interval_seconds: Option<u64>,
    offline_threshold_seconds: Option<u64>,
}

fn default_database_url() -> String {
    "sqlite://nodenexus.db".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_telegram_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_offline_threshold() -> u64 {
    120
}

fn default_notification_key() -> String {
    // Development key only. Override NOTIFICATION_ENCRYPTION_KEY in production.
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string()
}

impl ServerConfig {
    /// Loads `.env`, then the optional TOML file, then environment variables.
    /// Environment values override file values.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let file_config = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                let contents = fs::read_to_string(path_str).map_err(|source| ConfigError::Read {
                    path: path_str.to_string(),
                    source,
                })?;
                toml::from_str(&contents)?
            }
            _ => PartialServerConfig::default(),
        };

        let env_config: PartialServerConfig = envy::from_env()?;

        Self::from_layers(file_config, env_config)
    }

    fn from_layers(file: PartialServerConfig, env: PartialServerConfig) -> Result<Self, ConfigError> {
        let config = ServerConfig {
            database_url: env.database_url.or(file.database_url).unwrap_or_else(default_database_url),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            notification_encryption_key: env
                .notification_encryption_key
                .or(file.notification_encryption_key)
                .unwrap_or_else(default_notification_key),
            telegram_bot_token: env.telegram_bot_token.or(file.telegram_bot_token),
            telegram_api_base: env
                .telegram_api_base
                .or(file.telegram_api_base)
                .unwrap_or_else(default_telegram_api_base),
            heartbeat_interval_seconds: env
                .heartbeat_interval_seconds
                .or(file.heartbeat_interval_seconds)
                .unwrap_or_else(default_heartbeat_interval),
            offline_threshold_seconds: env
                .offline_threshold_seconds
                .or(file.offline_threshold_seconds)
                .unwrap_or_else(default_offline_threshold),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_seconds must be positive".to_string()));
        }
        if self.offline_threshold_seconds == 0 || self.offline_threshold_seconds > MAX_OFFLINE_THRESHOLD_SECS {
            return Err(ConfigError::Invalid(format!(
                "offline_threshold_seconds must be between 1 and {MAX_OFFLINE_THRESHOLD_SECS}"
            )));
        }
        Ok(())
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            tick_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            offline_threshold: chrono::Duration::seconds(self.offline_threshold_seconds as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config =
            ServerConfig::from_layers(PartialServerConfig::default(), PartialServerConfig::default()).unwrap();
        assert_eq!(config.database_url, "sqlite://nodenexus.db");
        assert_eq!(config.heartbeat_interval_seconds, 30);
        assert_eq!(config.offline_threshold_seconds, 120);
        assert_eq!(config.telegram_api_base, "https://api.telegram.org");
        assert!(config.telegram_bot_token.is_none());
    }

    #[test]
    fn environment_overrides_file() {
        let file: PartialServerConfig = toml::from_str(
            r#"
            database_url = "sqlite://file.db"
            heartbeat_interval_seconds = 10
            offline_threshold_seconds = 60
            "#,
        )
        .unwrap();
        let env = PartialServerConfig {
            database_url: Some("sqlite://env.db".to_string()),
            ..Default::default()
        };

        let config = ServerConfig::from_layers(file, env).unwrap();
        assert_eq!(config.database_url, "sqlite://env.db");
        assert_eq!(config.heartbeat_interval_seconds, 10);

        let heartbeat = config.heartbeat_config();
        assert_eq!(heartbeat.tick_interval, Duration::from_secs(10));
        assert_eq!(heartbeat.offline_threshold, chrono::Duration::seconds(60));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let file = PartialServerConfig {
            heartbeat_interval_seconds: Some(0),
            ..Default::default()
        };
        let err = ServerConfig::from_layers(file, PartialServerConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
