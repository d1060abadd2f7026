//! Retry-vs-fail decision for a failed delivery attempt.
//!
//! Kept free of I/O: the worker classifies the provider error once, then asks
//! [`decide_disposition`] what to do with the attempt.

use std::time::Duration;
use tgcast_channels::SendError;

use crate::queue::RetryDirective;

/// Provider failure, reduced to what matters for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Backpressure from the provider account; the channel is not at fault.
    RateLimited { wait: Duration },
    /// No write permission, banned/private or unknown destination.
    Unavailable,
    Unknown,
}

impl FailureKind {
    /// Whether the failure counts toward the channel's circuit breaker.
    pub fn counts_against_channel(&self) -> bool {
        !matches!(self, FailureKind::RateLimited { .. })
    }
}

impl From<&SendError> for FailureKind {
    fn from(err: &SendError) -> Self {
        match err {
            SendError::FloodWait { seconds } => FailureKind::RateLimited {
                wait: Duration::from_secs(*seconds),
            },
            SendError::WriteForbidden(_) | SendError::BannedOrPrivate(_) | SendError::NotFound(_) => {
                FailureKind::Unavailable
            }
            SendError::NotConnected | SendError::Other(_) => FailureKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry(RetryDirective),
    Fail,
}

/// Decide what happens after attempt number `attempt` (1-based) failed.
///
/// Rate limits always retry after the provider's wait. Anything else retries
/// with backoff while `attempt < retry_limit`.
pub fn decide_disposition(attempt: u32, retry_limit: u32, kind: &FailureKind) -> Disposition {
    match kind {
        FailureKind::RateLimited { wait } => Disposition::Retry(RetryDirective::After(*wait)),
        FailureKind::Unavailable | FailureKind::Unknown if attempt < retry_limit => {
            Disposition::Retry(RetryDirective::Backoff)
        }
        FailureKind::Unavailable | FailureKind::Unknown => Disposition::Fail,
    }
}
