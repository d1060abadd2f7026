//! Campaign state store port.
//!
//! The orchestrator, the delivery worker and the lifecycle service only talk
//! to [`CampaignStore`]; [`crate::persistence::CampaignDb`] is the SQLite adapter.

use async_trait::async_trait;
use tgcast_core::Result;

use crate::model::{
    AttemptStart, Campaign, CampaignPatch, CampaignPlan, CampaignProgress, CampaignStatus, Channel,
    ChannelHealth, DeliveryTask, NewCampaign,
};

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>>;

    /// Campaign with its template and every channel of its batch.
    async fn load_plan(&self, campaign_id: &str) -> Result<Option<CampaignPlan>>;

    /// QUEUED tasks of a campaign in creation order.
    async fn queued_tasks(&self, campaign_id: &str) -> Result<Vec<DeliveryTask>>;

    async fn get_channel(&self, id: &str) -> Result<Option<Channel>>;

    /// Insert a QUEUED campaign plus one QUEUED task per active channel of its batch.
    async fn create_campaign(&self, new: &NewCampaign) -> Result<Campaign>;

    /// Apply a patch; only QUEUED or PAUSED campaigns are editable.
    async fn update_campaign(&self, id: &str, patch: &CampaignPatch) -> Result<Campaign>;

    /// Delete a campaign and its tasks. Returns false when it did not exist.
    async fn delete_campaign(&self, id: &str) -> Result<bool>;

    /// Compare-and-set the campaign status. Returns false when the current
    /// status is not one of `from`.
    ///
    /// Entering RUNNING stamps `started_at` once; entering a terminal status
    /// stamps `completed_at`.
    async fn transition_campaign(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool>;

    async fn record_campaign_error(&self, id: &str, error: &str) -> Result<()>;

    /// Claim a task for one delivery attempt.
    ///
    /// Only tasks of a RUNNING campaign are claimed: a QUEUED or abandoned
    /// SENDING task moves to SENDING and its attempt is counted. Under any other
    /// campaign status a SENDING task is put back to QUEUED so a later resume
    /// picks it up.
    async fn begin_attempt(&self, task_id: &str) -> Result<AttemptStart>;

    async fn mark_task_sent(&self, task_id: &str) -> Result<()>;

    /// Put a task back to QUEUED after a recoverable failure.
    async fn requeue_task(&self, task_id: &str, error: &str) -> Result<()>;

    async fn mark_task_failed(&self, task_id: &str, error: &str) -> Result<()>;

    /// Atomically bump the channel's consecutive error counter and deactivate
    /// it once the counter reaches `threshold`.
    async fn record_channel_failure(
        &self,
        channel_id: &str,
        error: &str,
        threshold: u32,
    ) -> Result<ChannelHealth>;

    /// Reset the consecutive error counter after a successful send.
    async fn record_channel_success(&self, channel_id: &str) -> Result<()>;

    /// Task counts per status, read only.
    async fn task_counts(&self, campaign_id: &str) -> Result<CampaignProgress>;

    /// Recount tasks, persist progress, and complete the campaign at 100%
    /// when it is RUNNING or PAUSED.
    async fn recompute_progress(&self, campaign_id: &str) -> Result<CampaignProgress>;
}
