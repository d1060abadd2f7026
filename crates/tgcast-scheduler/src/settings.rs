//! Runtime delivery settings derived from `[delivery]` config.

use std::time::Duration;
use tgcast_core::config::DeliveryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    /// Base delay of the exponential retry backoff.
    pub retry_delay: Duration,
    /// Active delivery jobs older than this are reclaimed.
    pub expire_in: Duration,
    /// Relative jitter on send offsets, in [0, 1).
    pub jitter_ratio: f64,
    /// Consecutive failures that switch a channel off.
    pub channel_error_threshold: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            expire_in: Duration::from_secs(config.expire_in_minutes * 60),
            jitter_ratio: config.jitter_ratio,
            channel_error_threshold: config.channel_error_threshold,
        }
    }
}
