//! Delivery worker: one `SendMessage` job, one provider call.
//!
//! ```text
//! job ─► begin_attempt ─► provider.send
//!           │ terminal or      ├─ Ok  ─► SENT, channel reset, progress, complete
//!           │ not RUNNING      └─ Err ─► classify ─► channel penalty?
//!           ▼                                └─► decide_disposition
//!        complete                                  ├─ Retry ─► QUEUED, queue.fail(directive)
//!        (duplicate / halted)                      └─ Fail  ─► FAILED, progress, queue.fail(Never)
//! ```
//!
//! The task's `attempts` against the campaign's `retry_limit` is the only
//! retry budget; send jobs are enqueued with an unbounded queue budget.

use futures::future::join_all;
use std::sync::Arc;
use tgcast_channels::{Media, MessagingProvider, SendError};
use tgcast_core::Result;
use tgcast_core::types::SendMessage;

use crate::disposition::{Disposition, FailureKind, decide_disposition};
use crate::model::AttemptStart;
use crate::queue::{Job, RetryDirective, TaskQueue};
use crate::settings::DeliverySettings;
use crate::store::CampaignStore;

/// Error code stored on tasks whose last claimed attempt never settled.
pub const ABANDONED_CODE: &str = "ATTEMPT_ABANDONED";

/// What happened to one delivery job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Recoverable failure, handed back to the queue.
    Retrying(RetryDirective),
    /// Terminal failure, task is FAILED.
    Failed,
    /// Task was already terminal; nothing sent.
    Duplicate,
    /// Campaign is paused, cancelled or failed; nothing sent.
    Halted,
    /// Payload could not be decoded.
    Rejected,
    /// Store or queue error; the job was failed with backoff.
    Errored,
}

pub struct DeliveryWorker {
    store: Arc<dyn CampaignStore>,
    queue: Arc<dyn TaskQueue>,
    provider: Arc<dyn MessagingProvider>,
    settings: DeliverySettings,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        queue: Arc<dyn TaskQueue>,
        provider: Arc<dyn MessagingProvider>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            queue,
            provider,
            settings,
        }
    }

    /// Process a polled batch concurrently. One job's failure never affects the others.
    pub async fn process_batch(&self, jobs: Vec<Job>) -> Vec<DeliveryOutcome> {
        join_all(jobs.iter().map(|job| self.process(job))).await
    }

    pub async fn process(&self, job: &Job) -> DeliveryOutcome {
        let message: SendMessage = match job.decode() {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("❌ {}", e);
                if let Err(qe) = self.queue.fail(&job.id, RetryDirective::Never).await {
                    tracing::error!("Failed to reject job {}: {}", job.id, qe);
                }
                return DeliveryOutcome::Rejected;
            }
        };

        match self.deliver(job, &message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    "❌ Delivery of task {} to {} errored: {}",
                    message.task_id,
                    message.destination,
                    e
                );
                if let Err(qe) = self.queue.fail(&job.id, RetryDirective::Backoff).await {
                    tracing::error!("Failed to release job {}: {}", job.id, qe);
                }
                DeliveryOutcome::Errored
            }
        }
    }

    async fn deliver(&self, job: &Job, message: &SendMessage) -> Result<DeliveryOutcome> {
        let (attempt, retry_limit) = match self.store.begin_attempt(&message.task_id).await? {
            AttemptStart::Started {
                attempt,
                retry_limit,
                abandoned,
            } => {
                if abandoned && attempt > retry_limit {
                    return self.give_up(job, message, attempt).await;
                }
                (attempt, retry_limit)
            }
            AttemptStart::Finished => {
                tracing::debug!("Task {} already finished, skipping duplicate job", message.task_id);
                self.queue.complete(&job.id).await?;
                return Ok(DeliveryOutcome::Duplicate);
            }
            AttemptStart::Halted(status) => {
                tracing::info!(
                    "⏸️ Campaign {} is {}, dropping send to {}",
                    message.campaign_id,
                    status,
                    message.destination
                );
                self.queue.complete(&job.id).await?;
                return Ok(DeliveryOutcome::Halted);
            }
        };

        let media = message.media().map(|(kind, url)| Media { kind, url });
        match self
            .provider
            .send(&message.destination, &message.content, media)
            .await
        {
            Ok(sent) => {
                self.store.mark_task_sent(&message.task_id).await?;
                self.store.record_channel_success(&message.channel_id).await?;
                let progress = self.store.recompute_progress(&message.campaign_id).await?;
                self.queue.complete(&job.id).await?;
                tracing::info!(
                    "📨 Sent to {} (msg {}), campaign {} at {}%",
                    message.destination,
                    sent.id,
                    message.campaign_id,
                    progress.progress
                );
                Ok(DeliveryOutcome::Sent)
            }
            Err(err) => self.handle_failure(job, message, attempt, retry_limit, err).await,
        }
    }

    async fn handle_failure(
        &self,
        job: &Job,
        message: &SendMessage,
        attempt: u32,
        retry_limit: u32,
        err: SendError,
    ) -> Result<DeliveryOutcome> {
        let kind = FailureKind::from(&err);
        let error_text = format!("{}: {}", err.code(), err);

        if kind.counts_against_channel() {
            let health = self
                .store
                .record_channel_failure(
                    &message.channel_id,
                    &error_text,
                    self.settings.channel_error_threshold,
                )
                .await?;
            if health.deactivated {
                tracing::warn!(
                    "🔌 Channel {} deactivated after {} consecutive errors",
                    message.destination,
                    health.error_count
                );
            }
        }

        match decide_disposition(attempt, retry_limit, &kind) {
            Disposition::Retry(directive) => {
                self.store.requeue_task(&message.task_id, &error_text).await?;
                self.queue.fail(&job.id, directive).await?;
                match directive {
                    RetryDirective::After(wait) => tracing::warn!(
                        "⏱️ {} rate limited, retrying in {}s",
                        message.destination,
                        wait.as_secs()
                    ),
                    _ => tracing::warn!(
                        "🔁 Send to {} failed (attempt {}/{}): {}",
                        message.destination,
                        attempt,
                        retry_limit,
                        error_text
                    ),
                }
                Ok(DeliveryOutcome::Retrying(directive))
            }
            Disposition::Fail => {
                self.store.mark_task_failed(&message.task_id, &error_text).await?;
                let progress = self.store.recompute_progress(&message.campaign_id).await?;
                self.queue.fail(&job.id, RetryDirective::Never).await?;
                tracing::error!(
                    "❌ Send to {} failed for good after {} attempt(s): {} (campaign {} at {}%)",
                    message.destination,
                    attempt,
                    error_text,
                    message.campaign_id,
                    progress.progress
                );
                Ok(DeliveryOutcome::Failed)
            }
        }
    }

    /// The previous claim never settled and it used up the budget: fail without sending.
    async fn give_up(&self, job: &Job, message: &SendMessage, attempt: u32) -> Result<DeliveryOutcome> {
        let error_text = format!(
            "{ABANDONED_CODE}: Delivery attempt never completed, retry limit reached after {} attempt(s)",
            attempt - 1
        );
        self.store.mark_task_failed(&message.task_id, &error_text).await?;
        let progress = self.store.recompute_progress(&message.campaign_id).await?;
        self.queue.fail(&job.id, RetryDirective::Never).await?;
        tracing::error!(
            "❌ Send to {} abandoned (campaign {} at {}%)",
            message.destination,
            message.campaign_id,
            progress.progress
        );
        Ok(DeliveryOutcome::Failed)
    }
}
