//! Campaign orchestrator: expands a started campaign into delivery jobs.
//!
//! ## Schedule
//! ```text
//! base  = 60s / delivery_rate
//! t(i)  = i * base * (1 + u),  u ~ U[-jitter, +jitter]
//!
//! rate 20/min, jitter 0.2:
//!   task 0 ── 0s
//!   task 1 ── 2.4s ..= 3.6s
//!   task 2 ── 4.8s ..= 7.2s
//! ```
//! Every job also carries `singleton_key = campaign_id` with a window of
//! `base`, so the queue never activates two sends of one campaign closer
//! together than the configured rate, whatever the jitter did.

use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tgcast_core::TgcastError;
use tgcast_core::types::{SEND_MESSAGE_QUEUE, SendMessage, StartCampaign};

use crate::model::{Campaign, CampaignStatus};
use crate::queue::{EnqueueOptions, TaskQueue};
use crate::settings::DeliverySettings;
use crate::store::CampaignStore;

/// Queue-side budget of a send job. The delivery worker ends a task by its own
/// attempt count, so the queue never gives up on one, including after expiry.
pub const SEND_JOB_RETRY_LIMIT: u32 = u32::MAX;

/// Error text stored on tasks whose channel went inactive before expansion.
pub const CHANNEL_INACTIVE: &str = "Channel is inactive";

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("No active channels found for campaign")]
    NoActiveChannels,

    #[error("No queued tasks found for campaign")]
    NoQueuedTasks,

    #[error("Failed to enqueue deliveries: {0}")]
    Enqueue(#[source] TgcastError),

    #[error(transparent)]
    Store(#[from] TgcastError),
}

/// Outcome of one orchestration job.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationReport {
    pub campaign_id: String,
    /// Delivery jobs enqueued.
    pub enqueued: usize,
    /// Tasks not enqueued (inactive channel or deduplicated).
    pub skipped: usize,
    /// Stale pending deliveries cancelled before expansion.
    pub purged: usize,
    pub base_delay: Duration,
    pub estimated_duration: Duration,
    /// The campaign was not in a state this job applies to.
    pub noop: bool,
}

impl OrchestrationReport {
    fn noop(campaign_id: &str) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            enqueued: 0,
            skipped: 0,
            purged: 0,
            base_delay: Duration::ZERO,
            estimated_duration: Duration::ZERO,
            noop: true,
        }
    }
}

/// Spacing between two sends at `delivery_rate` messages per minute.
pub fn base_delay(delivery_rate: u32) -> Duration {
    Duration::from_secs_f64(60.0 / f64::from(delivery_rate.max(1)))
}

/// Send offsets for `count` tasks, index order.
pub fn compute_offsets<R: Rng>(
    count: usize,
    base: Duration,
    jitter_ratio: f64,
    rng: &mut R,
) -> Vec<Duration> {
    let base = base.as_secs_f64();
    (0..count)
        .map(|i| {
            let factor = if jitter_ratio > 0.0 {
                1.0 + rng.gen_range(-jitter_ratio..=jitter_ratio)
            } else {
                1.0
            };
            Duration::from_secs_f64((i as f64 * base * factor).max(0.0))
        })
        .collect()
}

/// Time to drain `count` sends spaced by `base`, saturating on overflow.
pub fn estimated_duration(base: Duration, count: usize) -> Duration {
    base.saturating_mul(u32::try_from(count).unwrap_or(u32::MAX))
}

pub struct CampaignOrchestrator {
    store: Arc<dyn CampaignStore>,
    queue: Arc<dyn TaskQueue>,
    settings: DeliverySettings,
}

impl CampaignOrchestrator {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        queue: Arc<dyn TaskQueue>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    /// Handle one `StartCampaign` job.
    pub async fn orchestrate(
        &self,
        job: &StartCampaign,
    ) -> Result<OrchestrationReport, OrchestrationError> {
        let campaign_id = job.campaign_id.as_str();
        let plan = self
            .store
            .load_plan(campaign_id)
            .await?
            .ok_or_else(|| OrchestrationError::CampaignNotFound(campaign_id.to_string()))?;
        let campaign = &plan.campaign;

        let expected = if job.resume {
            CampaignStatus::Running
        } else {
            CampaignStatus::Queued
        };
        if campaign.status != expected {
            tracing::info!(
                "⏭️ Campaign {} is {}, nothing to {}",
                campaign_id,
                campaign.status,
                if job.resume { "resume" } else { "start" }
            );
            return Ok(OrchestrationReport::noop(campaign_id));
        }

        let active: HashSet<&str> = plan.active_channels().map(|c| c.id.as_str()).collect();
        let tasks = self.store.queued_tasks(campaign_id).await?;

        if !job.resume {
            if active.is_empty() {
                return Err(self.reject(campaign, OrchestrationError::NoActiveChannels).await);
            }
            if tasks.is_empty() {
                return Err(self.reject(campaign, OrchestrationError::NoQueuedTasks).await);
            }
        }

        let purged = self
            .queue
            .cancel_pending(SEND_MESSAGE_QUEUE, campaign_id)
            .await
            .map_err(OrchestrationError::Enqueue)?;

        let (deliverable, orphaned): (Vec<_>, Vec<_>) = tasks
            .iter()
            .partition(|t| active.contains(t.channel_id.as_str()));

        let base = base_delay(campaign.delivery_rate);
        let offsets = compute_offsets(
            deliverable.len(),
            base,
            self.settings.jitter_ratio,
            &mut rand::thread_rng(),
        );

        let mut enqueued = 0;
        let mut skipped = orphaned.len();
        for (task, offset) in deliverable.iter().zip(offsets) {
            let Some(channel) = plan.channels.iter().find(|c| c.id == task.channel_id) else {
                continue;
            };
            let message = SendMessage {
                task_id: task.id.clone(),
                campaign_id: campaign_id.to_string(),
                channel_id: channel.id.clone(),
                destination: channel.username.clone(),
                content: plan.template.content.clone(),
                media_type: plan.template.media_type,
                media_url: plan.template.media_url.clone(),
                attempt: task.attempts,
            };
            let options = EnqueueOptions {
                start_after: offset,
                retry_limit: SEND_JOB_RETRY_LIMIT,
                retry_delay: self.settings.retry_delay,
                retry_backoff: true,
                expire_in: self.settings.expire_in,
                singleton_key: Some(campaign_id.to_string()),
                singleton_window: Some(base),
            };

            let payload = serde_json::to_value(&message).map_err(TgcastError::from)?;
            match self.queue.enqueue(SEND_MESSAGE_QUEUE, payload, &options).await {
                Ok(Some(_)) => enqueued += 1,
                Ok(None) => skipped += 1,
                Err(e) => return Err(self.abort(campaign, e).await),
            }
        }

        for task in &orphaned {
            self.store.mark_task_failed(&task.id, CHANNEL_INACTIVE).await?;
        }
        if !orphaned.is_empty() {
            tracing::warn!(
                "⚠️ Campaign {}: {} task(s) skipped, channel inactive",
                campaign_id,
                orphaned.len()
            );
        }

        if !job.resume {
            self.store
                .transition_campaign(campaign_id, &[CampaignStatus::Queued], CampaignStatus::Running)
                .await?;
        }
        // Fast deliveries may already be done; this is also where a resume
        // with nothing left to send completes.
        self.store.recompute_progress(campaign_id).await?;

        let estimated_duration = estimated_duration(base, enqueued);
        tracing::info!(
            "🚀 Campaign {} {}: {} message(s) queued, 1 every {:.1}s, ~{}s total",
            campaign_id,
            if job.resume { "resumed" } else { "started" },
            enqueued,
            base.as_secs_f64(),
            estimated_duration.as_secs()
        );

        Ok(OrchestrationReport {
            campaign_id: campaign_id.to_string(),
            enqueued,
            skipped,
            purged,
            base_delay: base,
            estimated_duration,
            noop: false,
        })
    }

    /// Record why a start was refused; the campaign keeps its status.
    async fn reject(&self, campaign: &Campaign, err: OrchestrationError) -> OrchestrationError {
        tracing::warn!("⚠️ Campaign {} not started: {}", campaign.id, err);
        if let Err(e) = self.store.record_campaign_error(&campaign.id, &err.to_string()).await {
            tracing::error!("Failed to record error on campaign {}: {}", campaign.id, e);
        }
        err
    }

    /// Undo a partial expansion and mark the campaign FAILED.
    async fn abort(&self, campaign: &Campaign, cause: TgcastError) -> OrchestrationError {
        tracing::error!("❌ Campaign {} enqueue failed: {}", campaign.id, cause);

        if let Err(e) = self.queue.cancel_pending(SEND_MESSAGE_QUEUE, &campaign.id).await {
            tracing::error!("Failed to purge deliveries of campaign {}: {}", campaign.id, e);
        }
        let err = OrchestrationError::Enqueue(cause);
        let marked = self
            .store
            .transition_campaign(
                &campaign.id,
                &[CampaignStatus::Queued, CampaignStatus::Running],
                CampaignStatus::Failed,
            )
            .await;
        if let Err(e) = marked {
            tracing::error!("Failed to mark campaign {} as failed: {}", campaign.id, e);
        }
        if let Err(e) = self.store.record_campaign_error(&campaign.id, &err.to_string()).await {
            tracing::error!("Failed to record error on campaign {}: {}", campaign.id, e);
        }
        err
    }
}
