//! Campaign lifecycle: create, start/pause/resume/cancel, edit, delete, stats.
//!
//! This is the surface an API layer calls. Status changes that belong to the
//! workers (RUNNING on successful expansion, COMPLETED at 100%) never happen here.

use std::sync::Arc;
use tgcast_core::types::{SEND_MESSAGE_QUEUE, START_CAMPAIGN_QUEUE, StartCampaign};
use tgcast_core::{Result, TgcastError};

use crate::model::{Campaign, CampaignAction, CampaignPatch, CampaignProgress, CampaignStatus, NewCampaign};
use crate::queue::{EnqueueOptions, TaskQueue};
use crate::store::CampaignStore;

pub struct CampaignService {
    store: Arc<dyn CampaignStore>,
    queue: Arc<dyn TaskQueue>,
}

impl CampaignService {
    pub fn new(store: Arc<dyn CampaignStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn create_campaign(&self, new: &NewCampaign) -> Result<Campaign> {
        let campaign = self.store.create_campaign(new).await?;
        tracing::info!(
            "📋 Campaign '{}' created ({}): {} task(s) at {}/min",
            campaign.name,
            campaign.id,
            campaign.total_tasks,
            campaign.delivery_rate
        );
        Ok(campaign)
    }

    /// Apply an operator action and return the refreshed campaign.
    pub async fn apply_action(
        &self,
        campaign_id: &str,
        action: CampaignAction,
        user_id: Option<&str>,
    ) -> Result<Campaign> {
        let campaign = self.require(campaign_id).await?;
        campaign
            .status
            .transition(action)
            .map_err(TgcastError::InvalidState)?;

        match action {
            CampaignAction::Start => {
                self.enqueue_start(campaign_id, user_id, false).await?;
            }
            CampaignAction::Pause => {
                self.cas(campaign_id, &[CampaignStatus::Running], CampaignStatus::Paused)
                    .await?;
                let purged = self
                    .queue
                    .cancel_pending(SEND_MESSAGE_QUEUE, campaign_id)
                    .await?;
                tracing::info!("⏸️ Campaign {} paused, {} pending send(s) purged", campaign_id, purged);
            }
            CampaignAction::Resume => {
                self.cas(campaign_id, &[CampaignStatus::Paused], CampaignStatus::Running)
                    .await?;
                self.enqueue_start(campaign_id, user_id, true).await?;
            }
            CampaignAction::Cancel => {
                self.cas(
                    campaign_id,
                    &[CampaignStatus::Queued, CampaignStatus::Running, CampaignStatus::Paused],
                    CampaignStatus::Cancelled,
                )
                .await?;
                let sends = self
                    .queue
                    .cancel_pending(SEND_MESSAGE_QUEUE, campaign_id)
                    .await?;
                let starts = self
                    .queue
                    .cancel_pending(START_CAMPAIGN_QUEUE, campaign_id)
                    .await?;
                tracing::info!(
                    "🛑 Campaign {} cancelled, {} pending job(s) purged",
                    campaign_id,
                    sends + starts
                );
            }
        }

        self.require(campaign_id).await
    }

    pub async fn update_campaign(&self, campaign_id: &str, patch: &CampaignPatch) -> Result<Campaign> {
        self.store.update_campaign(campaign_id, patch).await
    }

    /// Delete a campaign that is not running; pending jobs go with it.
    pub async fn delete_campaign(&self, campaign_id: &str) -> Result<()> {
        let campaign = self.require(campaign_id).await?;
        if campaign.status == CampaignStatus::Running {
            return Err(TgcastError::InvalidState(
                "Cannot delete a running campaign".into(),
            ));
        }
        self.queue.cancel_pending(SEND_MESSAGE_QUEUE, campaign_id).await?;
        self.queue.cancel_pending(START_CAMPAIGN_QUEUE, campaign_id).await?;
        self.store.delete_campaign(campaign_id).await?;
        tracing::info!("🗑️ Campaign {} deleted", campaign_id);
        Ok(())
    }

    pub async fn campaign_stats(&self, campaign_id: &str) -> Result<CampaignProgress> {
        self.store.task_counts(campaign_id).await
    }

    async fn require(&self, campaign_id: &str) -> Result<Campaign> {
        self.store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| TgcastError::NotFound(format!("Campaign {campaign_id}")))
    }

    async fn cas(&self, campaign_id: &str, from: &[CampaignStatus], to: CampaignStatus) -> Result<()> {
        if self.store.transition_campaign(campaign_id, from, to).await? {
            Ok(())
        } else {
            Err(TgcastError::InvalidState(format!(
                "Campaign {campaign_id} changed status concurrently"
            )))
        }
    }

    async fn enqueue_start(&self, campaign_id: &str, user_id: Option<&str>, resume: bool) -> Result<()> {
        let job = StartCampaign {
            campaign_id: campaign_id.to_string(),
            user_id: user_id.map(str::to_string),
            resume,
        };
        let options = EnqueueOptions {
            retry_limit: 0,
            singleton_key: Some(campaign_id.to_string()),
            ..Default::default()
        };
        let queued = self
            .queue
            .enqueue(START_CAMPAIGN_QUEUE, serde_json::to_value(&job)?, &options)
            .await?;
        match queued {
            Some(job_id) => tracing::info!(
                "▶️ Campaign {} {} requested (job {})",
                campaign_id,
                if resume { "resume" } else { "start" },
                job_id
            ),
            None => tracing::info!("Campaign {} already has a pending orchestration job", campaign_id),
        }
        Ok(())
    }
}
