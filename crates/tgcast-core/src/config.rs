//! tgcast configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TgcastError};

/// Environment variable that overrides `telegram.bot_token`.
pub const BOT_TOKEN_ENV: &str = "TGCAST_TELEGRAM_BOT_TOKEN";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TgcastConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl TgcastConfig {
    /// Load config from the default path (~/.tgcast/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TgcastError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TgcastError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TgcastError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the tgcast home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tgcast")
    }

    /// Apply environment overrides (secrets are usually not kept in the file).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var(BOT_TOKEN_ENV)
            && !token.is_empty()
        {
            self.telegram.bot_token = token;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.workers.delivery_batch_size == 0 {
            return Err(TgcastError::Config(
                "workers.delivery_batch_size must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.delivery.jitter_ratio) {
            return Err(TgcastError::Config(
                "delivery.jitter_ratio must be in [0, 1)".into(),
            ));
        }
        if self.delivery.channel_error_threshold == 0 {
            return Err(TgcastError::Config(
                "delivery.channel_error_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// SQLite locations for the state store and the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_queue_path")]
    pub queue_path: String,
}

fn default_store_path() -> String { "~/.tgcast/tgcast.db".into() }
fn default_queue_path() -> String { "~/.tgcast/queue.db".into() }

impl DatabaseConfig {
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store_path).to_string())
    }

    pub fn queue_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.queue_path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            queue_path: default_queue_path(),
        }
    }
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Wait applied when Telegram signals a flood without a retry_after hint.
    #[serde(default = "default_flood_wait")]
    pub default_flood_wait_secs: u64,
}

fn default_api_base() -> String { "https://api.telegram.org".into() }
fn default_request_timeout() -> u64 { 30 }
fn default_flood_wait() -> u64 { 30 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
            default_flood_wait_secs: default_flood_wait(),
        }
    }
}

/// Worker polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_delivery_batch")]
    pub delivery_batch_size: usize,
    #[serde(default = "default_poll_interval")]
    pub delivery_poll_interval_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub campaign_poll_interval_secs: u64,
}

fn default_delivery_batch() -> usize { 10 }
fn default_poll_interval() -> u64 { 2 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            delivery_batch_size: default_delivery_batch(),
            delivery_poll_interval_secs: default_poll_interval(),
            campaign_poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Delivery scheduling and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Base delay for exponential retry backoff.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Active jobs older than this are reclaimed by the queue.
    #[serde(default = "default_expire_minutes")]
    pub expire_in_minutes: u64,
    /// Relative jitter applied to each send offset (0.2 = ±20%).
    #[serde(default = "default_jitter")]
    pub jitter_ratio: f64,
    /// Consecutive failures after which a channel is deactivated.
    #[serde(default = "default_error_threshold")]
    pub channel_error_threshold: u32,
}

fn default_retry_delay() -> u64 { 5 }
fn default_expire_minutes() -> u64 { 15 }
fn default_jitter() -> f64 { 0.2 }
fn default_error_threshold() -> u32 { 5 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay(),
            expire_in_minutes: default_expire_minutes(),
            jitter_ratio: default_jitter(),
            channel_error_threshold: default_error_threshold(),
        }
    }
}
