//! # tgcast core
//!
//! Types shared by every tgcast crate: configuration, the error taxonomy,
//! and the job payload contracts exchanged with the API layer.

pub mod config;
pub mod error;
pub mod types;

pub use config::TgcastConfig;
pub use error::{Result, TgcastError};
