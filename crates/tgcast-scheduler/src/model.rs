//! Campaign data model: campaigns, channels, templates and delivery tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tgcast_core::types::MediaType;

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CampaignStatus {
    /// Created, tasks materialized, waiting for a start action.
    Queued,
    /// Delivery jobs are enqueued and being worked.
    Running,
    /// Pending deliveries were purged; can be resumed.
    Paused,
    /// Every task reached SENT or FAILED.
    Completed,
    Cancelled,
    /// Orchestration could not enqueue the campaign.
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Queued => "QUEUED",
            CampaignStatus::Running => "RUNNING",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Cancelled => "CANCELLED",
            CampaignStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
        )
    }

    /// Content and settings may only change before the campaign runs or while paused.
    pub fn is_editable(&self) -> bool {
        matches!(self, CampaignStatus::Queued | CampaignStatus::Paused)
    }

    /// Status reached by applying `action`, or an explanation when not allowed.
    pub fn transition(self, action: CampaignAction) -> Result<CampaignStatus, String> {
        let next = match (action, self) {
            (CampaignAction::Start, CampaignStatus::Queued) => Some(CampaignStatus::Running),
            (CampaignAction::Pause, CampaignStatus::Running) => Some(CampaignStatus::Paused),
            (CampaignAction::Resume, CampaignStatus::Paused) => Some(CampaignStatus::Running),
            (CampaignAction::Cancel, status) if !status.is_terminal() => {
                Some(CampaignStatus::Cancelled)
            }
            _ => None,
        };
        next.ok_or_else(|| format!("Cannot {} a campaign that is {}", action, self))
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(CampaignStatus::Queued),
            "RUNNING" => Ok(CampaignStatus::Running),
            "PAUSED" => Ok(CampaignStatus::Paused),
            "COMPLETED" => Ok(CampaignStatus::Completed),
            "CANCELLED" => Ok(CampaignStatus::Cancelled),
            "FAILED" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {s}")),
        }
    }
}

/// Operator action on a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignAction {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl CampaignAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignAction::Start => "start",
            CampaignAction::Pause => "pause",
            CampaignAction::Resume => "resume",
            CampaignAction::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for CampaignAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" => Ok(CampaignAction::Start),
            "pause" => Ok(CampaignAction::Pause),
            "resume" => Ok(CampaignAction::Resume),
            "cancel" => Ok(CampaignAction::Cancel),
            _ => Err(format!("Invalid campaign action: {s}")),
        }
    }
}

/// Delivery task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Sending => "SENDING",
            TaskStatus::Sent => "SENT",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Sent | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(TaskStatus::Queued),
            "SENDING" => Ok(TaskStatus::Sending),
            "SENT" => Ok(TaskStatus::Sent),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// A campaign: one template delivered to every channel of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub batch_id: String,
    pub template_id: String,
    /// Messages per minute.
    pub delivery_rate: u32,
    /// Delivery attempts allowed per task.
    pub retry_limit: u32,
    pub status: CampaignStatus,
    /// 0..=100, share of tasks in a terminal state.
    pub progress: u8,
    pub total_tasks: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A destination channel and its health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    /// Handle used as the send destination, e.g. `@news`.
    pub username: String,
    pub title: Option<String>,
    pub is_active: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A named group of channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub content: String,
    pub media_type: Option<MediaType>,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One message to one channel on behalf of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub id: String,
    pub campaign_id: String,
    pub channel_id: String,
    pub status: TaskStatus,
    /// Attempts started so far.
    pub attempts: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Everything the orchestrator needs to expand a campaign.
#[derive(Debug, Clone)]
pub struct CampaignPlan {
    pub campaign: Campaign,
    pub template: Template,
    /// Every channel of the campaign's batch, active or not.
    pub channels: Vec<Channel>,
}

impl CampaignPlan {
    pub fn active_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_active)
    }
}

/// Task counts and derived progress for one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub campaign_id: String,
    pub status: CampaignStatus,
    pub total: u32,
    pub queued: u32,
    pub sending: u32,
    pub sent: u32,
    pub failed: u32,
    pub progress: u8,
}

impl CampaignProgress {
    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.sent + self.failed >= self.total
    }
}

/// Channel health after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHealth {
    pub error_count: u32,
    pub is_active: bool,
    /// This failure crossed the threshold and switched the channel off.
    pub deactivated: bool,
}

/// Result of claiming a task for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStart {
    /// The task is SENDING; `attempt` is 1-based and `retry_limit` is the
    /// campaign's current budget. `abandoned` means the previous attempt was
    /// claimed but never settled.
    Started {
        attempt: u32,
        retry_limit: u32,
        abandoned: bool,
    },
    /// The task is already terminal, or gone.
    Finished,
    /// The campaign is not RUNNING; nothing may be sent.
    Halted(CampaignStatus),
}

/// Input for creating a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub batch_id: String,
    pub template_id: String,
    pub delivery_rate: u32,
    pub retry_limit: u32,
}

impl NewCampaign {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Campaign name is required".into());
        }
        validate_rates(self.delivery_rate, self.retry_limit)
    }
}

/// Partial update of an editable campaign. `None` leaves the field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub delivery_rate: Option<u32>,
    pub retry_limit: Option<u32>,
}

impl CampaignPatch {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err("Campaign name is required".into());
        }
        validate_rates(self.delivery_rate.unwrap_or(1), self.retry_limit.unwrap_or(1))
    }
}

fn validate_rates(delivery_rate: u32, retry_limit: u32) -> Result<(), String> {
    if delivery_rate == 0 {
        return Err("delivery_rate must be at least 1 message per minute".into());
    }
    if retry_limit == 0 {
        return Err("retry_limit must be at least 1".into());
    }
    Ok(())
}

/// Percentage of tasks in a terminal state, floored, 0 when there are no tasks.
pub fn progress_percent(sent: u32, failed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let done = u64::from(sent) + u64::from(failed);
    (done * 100 / u64::from(total)).min(100) as u8
}
