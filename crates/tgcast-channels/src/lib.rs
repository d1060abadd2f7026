//! # tgcast channels
//! Messaging provider boundary and the Telegram implementation.

pub mod flood;
pub mod provider;
pub mod telegram;

pub use flood::{FloodGate, FloodGateStats, GatedProvider};
pub use provider::{Media, MessagingProvider, SendError, SentMessage};
pub use telegram::TelegramProvider;
