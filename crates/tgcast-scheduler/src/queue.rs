//! Durable task queue port.
//!
//! At-least-once delivery of JSON payloads with delayed start, retry with
//! backoff, expiry of stuck jobs and singleton keys. [`crate::job_queue::SqliteQueue`]
//! is the bundled adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tgcast_core::{Result, TgcastError};

/// Upper bound for exponential retry delays.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// How a job is scheduled, retried and deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    /// Delay before the job becomes available.
    pub start_after: Duration,
    /// Budgeted retries after the first attempt.
    pub retry_limit: u32,
    pub retry_delay: Duration,
    /// Double `retry_delay` on every budgeted retry.
    pub retry_backoff: bool,
    /// Active jobs older than this are reclaimed on the next poll.
    pub expire_in: Duration,
    pub singleton_key: Option<String>,
    /// With a key: at most one job per key is activated per window.
    /// Without a window the key deduplicates pending jobs at enqueue.
    pub singleton_window: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            start_after: Duration::ZERO,
            retry_limit: 0,
            retry_delay: Duration::from_secs(5),
            retry_backoff: false,
            expire_in: Duration::from_secs(15 * 60),
            singleton_key: None,
            singleton_window: None,
        }
    }
}

/// Queue-side job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Retry => "retry",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "retry" => Ok(JobState::Retry),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(format!("Invalid job state: {s}")),
        }
    }
}

/// What the queue should do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Fail permanently.
    Never,
    /// Retry with the job's own delay/backoff while budget remains.
    Backoff,
    /// Retry after exactly this delay without consuming budget.
    After(Duration),
}

/// A job handed out by [`TaskQueue::poll`].
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Budgeted retries already consumed.
    pub retry_count: u32,
    pub retry_limit: u32,
    pub singleton_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            TgcastError::Queue(format!("Invalid payload for job {} on {}: {e}", self.id, self.queue))
        })
    }
}

/// Per-state job counts of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub created: u64,
    pub retry: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn pending(&self) -> u64 {
        self.created + self.retry
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a job. Returns `None` when a singleton key deduplicated it.
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<Option<String>>;

    /// Activate up to `batch_size` due jobs.
    async fn poll(&self, queue: &str, batch_size: usize) -> Result<Vec<Job>>;

    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Fail an active job; returns the state the job ended up in.
    async fn fail(&self, job_id: &str, retry: RetryDirective) -> Result<JobState>;

    /// Cancel every not-yet-active job carrying `singleton_key`.
    async fn cancel_pending(&self, queue: &str, singleton_key: &str) -> Result<usize>;
}

/// Delay before the next budgeted retry.
pub fn retry_delay(options_delay: Duration, backoff: bool, retry_count: u32) -> Duration {
    if !backoff {
        return options_delay;
    }
    let factor = 2u32.saturating_pow(retry_count.min(20));
    options_delay.saturating_mul(factor).min(MAX_BACKOFF)
}
