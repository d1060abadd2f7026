//! SQLite-backed job queue.
//!
//! One `jobs` table shared by every named queue. Times are epoch milliseconds
//! so due/expiry checks are plain integer comparisons. Every operation runs
//! under the connection mutex, which makes poll/fail/cancel atomic with
//! respect to each other inside one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tgcast_core::{Result, TgcastError};

use crate::queue::{EnqueueOptions, Job, JobState, QueueStats, RetryDirective, TaskQueue, retry_delay};

pub struct SqliteQueue {
    conn: Mutex<Connection>,
}

struct Candidate {
    id: String,
    payload: String,
    retry_count: u32,
    retry_limit: u32,
    singleton_key: Option<String>,
    singleton_window_ms: Option<i64>,
    created_at: i64,
}

impl SqliteQueue {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TgcastError::Queue(format!("Queue open: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TgcastError::Queue(format!("Queue open: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'created',
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_limit INTEGER NOT NULL DEFAULT 0,
                retry_delay_ms INTEGER NOT NULL DEFAULT 0,
                retry_backoff INTEGER NOT NULL DEFAULT 0,
                start_after INTEGER NOT NULL,    -- epoch ms
                expire_in_ms INTEGER NOT NULL,
                singleton_key TEXT,
                singleton_window_ms INTEGER,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_fetch ON jobs(queue, state, start_after);
            CREATE INDEX IF NOT EXISTS idx_jobs_singleton ON jobs(queue, singleton_key, state);
            ",
        )
        .map_err(|e| TgcastError::Queue(format!("Migration: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TgcastError::Queue(format!("Lock: {e}")))
    }

    pub fn enqueue_at(
        &self,
        queue: &str,
        payload: &serde_json::Value,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;

        if let Some(key) = &options.singleton_key
            && options.singleton_window.is_none()
        {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM jobs WHERE queue = ?1 AND singleton_key = ?2
                        AND state IN ('created', 'retry', 'active'))",
                    params![queue, key],
                    |r| r.get(0),
                )
                .map_err(queue_err)?;
            if exists {
                tracing::debug!("🔁 [{}] job for '{}' already pending, skipped", queue, key);
                return Ok(None);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now_ms = now.timestamp_millis();
        conn.execute(
            "INSERT INTO jobs (id, queue, payload, state, retry_limit, retry_delay_ms, retry_backoff,
                start_after, expire_in_ms, singleton_key, singleton_window_ms, created_at)
             VALUES (?1, ?2, ?3, 'created', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                queue,
                payload.to_string(),
                options.retry_limit,
                millis(options.retry_delay),
                options.retry_backoff as i32,
                now_ms + millis(options.start_after),
                millis(options.expire_in),
                options.singleton_key,
                options.singleton_window.map(millis),
                now_ms,
            ],
        )
        .map_err(queue_err)?;
        Ok(Some(id))
    }

    /// Reclaim expired jobs, then activate due ones, honoring singleton windows.
    pub fn poll_at(&self, queue: &str, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<Job>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now_ms = now.timestamp_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(queue_err)?;

        let reclaimed = tx
            .execute(
                "UPDATE jobs SET
                    state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'failed' END,
                    completed_at = CASE WHEN retry_count < retry_limit THEN NULL ELSE ?2 END,
                    retry_count = CASE WHEN retry_count < retry_limit THEN retry_count + 1 ELSE retry_count END,
                    start_after = ?2
                 WHERE queue = ?1 AND state = 'active' AND started_at + expire_in_ms <= ?2",
                params![queue, now_ms],
            )
            .map_err(queue_err)?;
        if reclaimed > 0 {
            tracing::warn!("⏰ [{}] reclaimed {} expired job(s)", queue, reclaimed);
        }

        let candidates = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, payload, retry_count, retry_limit, singleton_key, singleton_window_ms, created_at
                     FROM jobs
                     WHERE queue = ?1 AND state IN ('created', 'retry') AND start_after <= ?2
                     ORDER BY start_after, created_at",
                )
                .map_err(queue_err)?;
            let rows = stmt
                .query_map(params![queue, now_ms], |r| {
                    Ok(Candidate {
                        id: r.get(0)?,
                        payload: r.get(1)?,
                        retry_count: r.get(2)?,
                        retry_limit: r.get(3)?,
                        singleton_key: r.get(4)?,
                        singleton_window_ms: r.get(5)?,
                        created_at: r.get(6)?,
                    })
                })
                .map_err(queue_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(queue_err)?
        };

        let mut last_activation: HashMap<String, Option<i64>> = HashMap::new();
        let mut jobs = Vec::new();
        for candidate in candidates {
            if jobs.len() >= batch_size {
                break;
            }

            if let (Some(key), Some(window)) =
                (&candidate.singleton_key, candidate.singleton_window_ms)
            {
                let last = match last_activation.get(key) {
                    Some(last) => *last,
                    None => {
                        let last: Option<i64> = tx
                            .query_row(
                                "SELECT MAX(started_at) FROM jobs WHERE queue = ?1 AND singleton_key = ?2",
                                params![queue, key],
                                |r| r.get(0),
                            )
                            .map_err(queue_err)?;
                        last_activation.insert(key.clone(), last);
                        last
                    }
                };
                if let Some(last) = last
                    && now_ms - last < window
                {
                    continue;
                }
                last_activation.insert(key.clone(), Some(now_ms));
            }

            tx.execute(
                "UPDATE jobs SET state = 'active', started_at = ?1 WHERE id = ?2",
                params![now_ms, candidate.id],
            )
            .map_err(queue_err)?;

            let payload = serde_json::from_str(&candidate.payload)?;
            jobs.push(Job {
                id: candidate.id,
                queue: queue.to_string(),
                payload,
                retry_count: candidate.retry_count,
                retry_limit: candidate.retry_limit,
                singleton_key: candidate.singleton_key,
                created_at: from_millis(candidate.created_at),
                started_at: Some(now),
            });
        }

        tx.commit().map_err(queue_err)?;
        Ok(jobs)
    }

    pub fn fail_at(&self, job_id: &str, retry: RetryDirective, now: DateTime<Utc>) -> Result<JobState> {
        let conn = self.conn()?;
        let (state, retry_count, retry_limit, delay_ms, backoff): (String, u32, u32, i64, bool) = conn
            .query_row(
                "SELECT state, retry_count, retry_limit, retry_delay_ms, retry_backoff
                 FROM jobs WHERE id = ?1",
                params![job_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()
            .map_err(queue_err)?
            .ok_or_else(|| TgcastError::NotFound(format!("Job {job_id}")))?;

        let state: JobState = state.parse().map_err(TgcastError::Queue)?;
        if state != JobState::Active {
            tracing::debug!("Job {} is {}, ignoring fail", job_id, state);
            return Ok(state);
        }

        let now_ms = now.timestamp_millis();
        let next = match retry {
            RetryDirective::After(delay) => {
                reschedule(&conn, job_id, now_ms + millis(delay), retry_count)?;
                JobState::Retry
            }
            RetryDirective::Backoff if retry_count < retry_limit => {
                let delay = retry_delay(Duration::from_millis(delay_ms.max(0) as u64), backoff, retry_count);
                reschedule(&conn, job_id, now_ms + millis(delay), retry_count + 1)?;
                JobState::Retry
            }
            RetryDirective::Backoff | RetryDirective::Never => {
                conn.execute(
                    "UPDATE jobs SET state = 'failed', completed_at = ?1 WHERE id = ?2",
                    params![now_ms, job_id],
                )
                .map_err(queue_err)?;
                JobState::Failed
            }
        };
        Ok(next)
    }

    pub fn job_state(&self, job_id: &str) -> Result<Option<JobState>> {
        let state: Option<String> = self
            .conn()?
            .query_row("SELECT state FROM jobs WHERE id = ?1", params![job_id], |r| r.get(0))
            .optional()
            .map_err(queue_err)?;
        state
            .map(|s| s.parse().map_err(TgcastError::Queue))
            .transpose()
    }

    pub fn stats(&self, queue: &str) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")
            .map_err(queue_err)?;
        let rows = stmt
            .query_map(params![queue], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(queue_err)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (state, count) = row.map_err(queue_err)?;
            let count = count.max(0) as u64;
            match state.parse::<JobState>().map_err(TgcastError::Queue)? {
                JobState::Created => stats.created = count,
                JobState::Retry => stats.retry = count,
                JobState::Active => stats.active = count,
                JobState::Completed => stats.completed = count,
                JobState::Failed => stats.failed = count,
                JobState::Cancelled => stats.cancelled = count,
            }
        }
        Ok(stats)
    }
}

fn reschedule(conn: &Connection, job_id: &str, start_after: i64, retry_count: u32) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET state = 'retry', start_after = ?1, retry_count = ?2 WHERE id = ?3",
        params![start_after, retry_count, job_id],
    )
    .map_err(queue_err)?;
    Ok(())
}

#[async_trait]
impl TaskQueue for SqliteQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<Option<String>> {
        self.enqueue_at(queue, &payload, options, Utc::now())
    }

    async fn poll(&self, queue: &str, batch_size: usize) -> Result<Vec<Job>> {
        self.poll_at(queue, batch_size, Utc::now())
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE jobs SET state = 'completed', completed_at = ?1 WHERE id = ?2 AND state = 'active'",
                params![Utc::now().timestamp_millis(), job_id],
            )
            .map_err(queue_err)?;
        if rows == 0 {
            tracing::debug!("Job {} was not active, complete ignored", job_id);
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, retry: RetryDirective) -> Result<JobState> {
        self.fail_at(job_id, retry, Utc::now())
    }

    async fn cancel_pending(&self, queue: &str, singleton_key: &str) -> Result<usize> {
        let cancelled = self
            .conn()?
            .execute(
                "UPDATE jobs SET state = 'cancelled', completed_at = ?1
                 WHERE queue = ?2 AND singleton_key = ?3 AND state IN ('created', 'retry')",
                params![Utc::now().timestamp_millis(), queue, singleton_key],
            )
            .map_err(queue_err)?;
        if cancelled > 0 {
            tracing::info!("🧹 [{}] cancelled {} pending job(s) for {}", queue, cancelled, singleton_key);
        }
        Ok(cancelled)
    }
}

fn queue_err(e: rusqlite::Error) -> TgcastError {
    TgcastError::Queue(e.to_string())
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const Q: &str = "send-message";

    fn payload(n: u32) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    #[test]
    fn test_delayed_job_not_handed_out_early() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let t0 = Utc::now();
        let options = EnqueueOptions {
            start_after: Duration::from_secs(10),
            ..Default::default()
        };
        queue.enqueue_at(Q, &payload(1), &options, t0).unwrap();

        assert!(queue.poll_at(Q, 10, t0 + secs(5)).unwrap().is_empty());
        let jobs = queue.poll_at(Q, 10, t0 + secs(10)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["n"], 1);
        assert!(queue.poll_at(Q, 10, t0 + secs(11)).unwrap().is_empty());
    }

    #[test]
    fn test_poll_respects_batch_size_and_order() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let t0 = Utc::now();
        for (n, delay) in [(1, 3), (2, 1), (3, 2)] {
            let options = EnqueueOptions {
                start_after: Duration::from_secs(delay),
                ..Default::default()
            };
            queue.enqueue_at(Q, &payload(n), &options, t0).unwrap();
        }
        let jobs = queue.poll_at(Q, 2, t0 + secs(5)).unwrap();
        let order: Vec<_> = jobs.iter().map(|j| j.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(order, vec![2, 3]);
        assert_eq!(queue.poll_at(Q, 2, t0 + secs(5)).unwrap().len(), 1);
    }

    #[test]
    fn test_singleton_window_throttles_activation() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let t0 = Utc::now();
        let options = EnqueueOptions {
            singleton_key: Some("campaign-1".into()),
            singleton_window: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        for n in 0..3 {
            assert!(queue.enqueue_at(Q, &payload(n), &options, t0).unwrap().is_some());
        }
        let other = EnqueueOptions {
            singleton_key: Some("campaign-2".into()),
            ..options.clone()
        };
        queue.enqueue_at(Q, &payload(9), &other, t0).unwrap();

        let first = queue.poll_at(Q, 10, t0).unwrap();
        assert_eq!(first.len(), 2, "one job per key per window");
        assert!(queue.poll_at(Q, 10, t0 + secs(1)).unwrap().is_empty());
        assert_eq!(queue.poll_at(Q, 10, t0 + secs(3)).unwrap().len(), 1);
        assert_eq!(queue.poll_at(Q, 10, t0 + secs(6)).unwrap().len(), 1);
        assert!(queue.poll_at(Q, 10, t0 + secs(9)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_singleton_dedup_on_enqueue() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let options = EnqueueOptions {
            singleton_key: Some("c1".into()),
            ..Default::default()
        };
        let first = queue.enqueue("start-campaign", payload(1), &options).await.unwrap();
        assert!(first.is_some());
        assert!(queue.enqueue("start-campaign", payload(2), &options).await.unwrap().is_none());

        let jobs = queue.poll("start-campaign", 5).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(queue.enqueue("start-campaign", payload(3), &options).await.unwrap().is_none());

        queue.complete(&jobs[0].id).await.unwrap();
        assert!(queue.enqueue("start-campaign", payload(4), &options).await.unwrap().is_some());
    }

    #[test]
    fn test_backoff_doubles_until_budget_is_spent() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let t0 = Utc::now();
        let options = EnqueueOptions {
            retry_limit: 2,
            retry_delay: Duration::from_secs(5),
            retry_backoff: true,
            ..Default::default()
        };
        let id = queue.enqueue_at(Q, &payload(1), &options, t0).unwrap().unwrap();

        let job = queue.poll_at(Q, 1, t0).unwrap().remove(0);
        assert_eq!(job.retry_count, 0);
        assert_eq!(queue.fail_at(&id, RetryDirective::Backoff, t0).unwrap(), JobState::Retry);
        assert!(queue.poll_at(Q, 1, t0 + secs(4)).unwrap().is_empty());

        let t1 = t0 + secs(5);
        let job = queue.poll_at(Q, 1, t1).unwrap().remove(0);
        assert_eq!(job.retry_count, 1);
        assert_eq!(queue.fail_at(&id, RetryDirective::Backoff, t1).unwrap(), JobState::Retry);
        assert!(queue.poll_at(Q, 1, t1 + secs(9)).unwrap().is_empty());

        let t2 = t1 + secs(10);
        let job = queue.poll_at(Q, 1, t2).unwrap().remove(0);
        assert_eq!(job.retry_count, 2);
        assert_eq!(queue.fail_at(&id, RetryDirective::Backoff, t2).unwrap(), JobState::Failed);
        assert_eq!(queue.job_state(&id).unwrap(), Some(JobState::Failed));
    }

    #[test]
    fn test_retry_after_does_not_consume_budget() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let t0 = Utc::now();
        let id = queue
            .enqueue_at(Q, &payload(1), &EnqueueOptions::default(), t0)
            .unwrap()
            .unwrap();

        queue.poll_at(Q, 1, t0).unwrap();
        let state = queue
            .fail_at(&id, RetryDirective::After(Duration::from_secs(30)), t0)
            .unwrap();
        assert_eq!(state, JobState::Retry);
        assert!(queue.poll_at(Q, 1, t0 + secs(29)).unwrap().is_empty());

        let job = queue.poll_at(Q, 1, t0 + secs(30)).unwrap().remove(0);
        assert_eq!(job.retry_count, 0);
        assert_eq!(
            queue.fail_at(&id, RetryDirective::Never, t0 + secs(30)).unwrap(),
            JobState::Failed
        );
    }

    #[test]
    fn test_expired_active_jobs_are_reclaimed() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let t0 = Utc::now();
        let retrying = EnqueueOptions {
            retry_limit: 1,
            expire_in: Duration::from_secs(60),
            ..Default::default()
        };
        let final_try = EnqueueOptions {
            retry_limit: 0,
            ..retrying.clone()
        };
        let keep = queue.enqueue_at(Q, &payload(1), &retrying, t0).unwrap().unwrap();
        let doomed = queue.enqueue_at(Q, &payload(2), &final_try, t0).unwrap().unwrap();

        assert_eq!(queue.poll_at(Q, 10, t0).unwrap().len(), 2);
        assert!(queue.poll_at(Q, 10, t0 + secs(30)).unwrap().is_empty());

        let reclaimed = queue.poll_at(Q, 10, t0 + secs(61)).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, keep);
        assert_eq!(reclaimed[0].retry_count, 1);
        assert_eq!(queue.job_state(&doomed).unwrap(), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn test_cancel_pending_spares_active_jobs() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let options = EnqueueOptions {
            singleton_key: Some("c1".into()),
            singleton_window: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        for n in 0..3 {
            queue.enqueue(Q, payload(n), &options).await.unwrap();
        }
        let active = queue.poll(Q, 10).await.unwrap();
        assert_eq!(active.len(), 1);

        assert_eq!(queue.cancel_pending(Q, "c1").await.unwrap(), 2);
        assert_eq!(queue.cancel_pending(Q, "c1").await.unwrap(), 0);
        assert_eq!(queue.job_state(&active[0].id).unwrap(), Some(JobState::Active));

        let stats = queue.stats(Q).unwrap();
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_on_cancelled_job_is_ignored() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let id = queue
            .enqueue(Q, payload(1), &EnqueueOptions {
                singleton_key: Some("c1".into()),
                singleton_window: Some(Duration::from_secs(1)),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        queue.cancel_pending(Q, "c1").await.unwrap();
        assert_eq!(
            queue.fail(&id, RetryDirective::Backoff).await.unwrap(),
            JobState::Cancelled
        );
        queue.complete(&id).await.unwrap();
        assert_eq!(queue.job_state(&id).unwrap(), Some(JobState::Cancelled));
    }

    #[test]
    fn test_open_file_queue() {
        let dir = std::env::temp_dir().join(format!("tgcast-queue-{}", uuid::Uuid::new_v4()));
        let path = dir.join("queue.db");
        {
            let queue = SqliteQueue::open(&path).unwrap();
            queue
                .enqueue_at(Q, &payload(1), &EnqueueOptions::default(), Utc::now())
                .unwrap();
        }
        let queue = SqliteQueue::open(&path).unwrap();
        assert_eq!(queue.stats(Q).unwrap().created, 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
