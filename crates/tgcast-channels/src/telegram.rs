//! Telegram Bot API provider: message and media delivery to channels.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tgcast_core::config::TelegramConfig;
use tgcast_core::types::MediaType;

use crate::provider::{Media, MessagingProvider, SendError, SentMessage};

/// Telegram provider over the Bot API.
pub struct TelegramProvider {
    config: TelegramConfig,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl TelegramProvider {
    pub fn new(config: TelegramConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            connected: AtomicBool::new(false),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    /// Call a Bot API method and unwrap the `{ok, result}` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, SendError> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Other(format!("Telegram {method} failed: {e}")))?;

        let envelope: TelegramApiResponse<T> = response
            .json()
            .await
            .map_err(|e| SendError::Other(format!("Invalid Telegram {method} response: {e}")))?;

        if !envelope.ok {
            return Err(classify_api_error(
                envelope.error_code,
                envelope.description.as_deref().unwrap_or_default(),
                envelope.parameters.and_then(|p| p.retry_after),
                self.config.default_flood_wait_secs,
            ));
        }

        envelope
            .result
            .ok_or_else(|| SendError::Other(format!("Telegram {method} returned no result")))
    }

    /// Get bot info.
    pub async fn get_me(&self) -> Result<TelegramUser, SendError> {
        self.call("getMe", &serde_json::json!({})).await
    }
}

#[async_trait]
impl MessagingProvider for TelegramProvider {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self) -> Result<(), SendError> {
        if self.config.bot_token.is_empty() {
            return Err(SendError::Other("Telegram bot token is not configured".into()));
        }
        let me = self.get_me().await?;
        tracing::info!(
            "Telegram bot: @{} ({})",
            me.username.as_deref().unwrap_or("unknown"),
            me.first_name
        );
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        destination: &str,
        content: &str,
        media: Option<Media<'_>>,
    ) -> Result<SentMessage, SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        let chat_id = normalize_destination(destination);
        let (method, body) = build_request(&chat_id, content, media);
        tracing::debug!("📤 {} → {}", method, chat_id);

        let message: TelegramMessage = self.call(method, &body).await?;
        Ok(SentMessage {
            id: message.message_id,
            sent_at: chrono::DateTime::from_timestamp(message.date, 0)
                .unwrap_or_else(chrono::Utc::now),
        })
    }
}

/// Pick the Bot API method and JSON body for a message.
fn build_request(
    chat_id: &str,
    content: &str,
    media: Option<Media<'_>>,
) -> (&'static str, serde_json::Value) {
    match media {
        None => (
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": content }),
        ),
        Some(Media { kind, url }) => {
            let (method, field) = match kind {
                MediaType::Photo => ("sendPhoto", "photo"),
                MediaType::Video => ("sendVideo", "video"),
                MediaType::Document => ("sendDocument", "document"),
            };
            let mut body = serde_json::json!({ "chat_id": chat_id, "caption": content });
            body[field] = serde_json::Value::String(url.to_string());
            (method, body)
        }
    }
}

/// Turn a channel handle into a Bot API `chat_id`.
///
/// Numeric ids pass through; `t.me` links and bare aliases become `@alias`.
pub fn normalize_destination(destination: &str) -> String {
    let trimmed = destination.trim();
    let alias = trimmed
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("t.me/");
    if alias.parse::<i64>().is_ok() || alias.starts_with('@') {
        alias.to_string()
    } else {
        format!("@{alias}")
    }
}

/// Map a Bot API error envelope to a typed [`SendError`].
pub fn classify_api_error(
    error_code: Option<i64>,
    description: &str,
    retry_after: Option<u64>,
    default_wait_secs: u64,
) -> SendError {
    let lower = description.to_lowercase();

    if error_code == Some(429) || retry_after.is_some() || lower.contains("too many requests") {
        return SendError::FloodWait {
            seconds: retry_after.unwrap_or(default_wait_secs),
        };
    }
    if lower.contains("chat not found") || lower.contains("username not occupied") {
        return SendError::NotFound(description.to_string());
    }
    if lower.contains("kicked") || lower.contains("banned") || lower.contains("private") {
        return SendError::BannedOrPrivate(description.to_string());
    }
    if error_code == Some(403)
        || lower.contains("not enough rights")
        || lower.contains("have no rights")
        || lower.contains("not a member")
    {
        return SendError::WriteForbidden(description.to_string());
    }

    SendError::Other(format!(
        "Telegram API error {}: {}",
        error_code.unwrap_or_default(),
        description
    ))
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
    pub migrate_to_chat_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    pub title: Option<String>,
}
