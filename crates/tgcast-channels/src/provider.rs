//! Messaging provider boundary.
//!
//! Workers only ever see [`MessagingProvider`] and the typed [`SendError`];
//! the wire protocol and its error strings stay inside each adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tgcast_core::types::MediaType;

/// Media attached to an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Media<'a> {
    pub kind: MediaType,
    pub url: &'a str,
}

/// A message accepted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: i64,
    pub sent_at: DateTime<Utc>,
}

/// Why a send was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Provider backpressure: retry after the given number of seconds.
    #[error("Rate limit exceeded, wait {seconds} seconds")]
    FloodWait { seconds: u64 },

    #[error("No permission to write to this chat: {0}")]
    WriteForbidden(String),

    #[error("Destination is banned or private: {0}")]
    BannedOrPrivate(String),

    #[error("Destination not found: {0}")]
    NotFound(String),

    #[error("Provider is not connected")]
    NotConnected,

    #[error("{0}")]
    Other(String),
}

impl SendError {
    /// Stable code for logs and persisted error text.
    pub fn code(&self) -> &'static str {
        match self {
            SendError::FloodWait { .. } => "FLOOD_WAIT",
            SendError::WriteForbidden(_) => "CHAT_WRITE_FORBIDDEN",
            SendError::BannedOrPrivate(_) => "CHANNEL_PRIVATE",
            SendError::NotFound(_) => "USERNAME_NOT_OCCUPIED",
            SendError::NotConnected => "NOT_CONNECTED",
            SendError::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// Seconds to wait before retrying, for backpressure errors only.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SendError::FloodWait { seconds } => Some(*seconds),
            _ => None,
        }
    }

    /// Errors caused by the destination itself rather than the transport.
    pub fn is_destination_error(&self) -> bool {
        matches!(
            self,
            SendError::WriteForbidden(_) | SendError::BannedOrPrivate(_) | SendError::NotFound(_)
        )
    }
}

/// A messaging provider with an explicit connection lifecycle.
///
/// Constructed and connected by the process bootstrap, then shared by the
/// workers as `Arc<dyn MessagingProvider>`.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), SendError>;

    async fn disconnect(&self) -> Result<(), SendError>;

    fn is_connected(&self) -> bool;

    /// Deliver `content` (plus optional media) to `destination`.
    async fn send(
        &self,
        destination: &str,
        content: &str,
        media: Option<Media<'_>>,
    ) -> Result<SentMessage, SendError>;
}
