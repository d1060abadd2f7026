//! Job payload contracts.
//!
//! The API layer enqueues [`StartCampaign`] to kick off orchestration; the
//! orchestrator enqueues one [`SendMessage`] per delivery task. Both are
//! consumed only by the tgcast workers.

use serde::{Deserialize, Serialize};

/// Queue carrying campaign orchestration jobs.
pub const START_CAMPAIGN_QUEUE: &str = "start-campaign";
/// Queue carrying single-message delivery jobs.
pub const SEND_MESSAGE_QUEUE: &str = "send-message";

/// Media attached to a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaType {
    Photo,
    Video,
    Document,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Photo => "PHOTO",
            MediaType::Video => "VIDEO",
            MediaType::Document => "DOCUMENT",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PHOTO" => Ok(MediaType::Photo),
            "VIDEO" => Ok(MediaType::Video),
            "DOCUMENT" => Ok(MediaType::Document),
            _ => Err(format!("Invalid media type: {s}")),
        }
    }
}

/// Orchestration job: expand a campaign into delivery jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCampaign {
    pub campaign_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Re-expand the remaining queued tasks of a resumed campaign.
    #[serde(default)]
    pub resume: bool,
}

/// Delivery job: one message to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub task_id: String,
    pub campaign_id: String,
    pub channel_id: String,
    /// Channel handle, e.g. `@news_channel`.
    pub destination: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub attempt: u32,
}

impl SendMessage {
    /// Media type and URL, only when both are present.
    pub fn media(&self) -> Option<(MediaType, &str)> {
        match (self.media_type, self.media_url.as_deref()) {
            (Some(kind), Some(url)) if !url.is_empty() => Some((kind, url)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_wire_format() {
        let json = serde_json::json!({
            "taskId": "t1",
            "campaignId": "c1",
            "channelId": "ch1",
            "destination": "@news",
            "content": "hello",
            "mediaType": "PHOTO",
            "mediaUrl": "https://example.com/a.jpg",
            "attempt": 0
        });
        let msg: SendMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.media(), Some((MediaType::Photo, "https://example.com/a.jpg")));
    }

    #[test]
    fn test_media_requires_url() {
        let json = serde_json::json!({
            "taskId": "t1",
            "campaignId": "c1",
            "channelId": "ch1",
            "destination": "@news",
            "content": "hello",
            "mediaType": "VIDEO",
            "attempt": 0
        });
        let msg: SendMessage = serde_json::from_value(json).unwrap();
        assert!(msg.media().is_none());
    }

    #[test]
    fn test_start_campaign_defaults() {
        let job: StartCampaign =
            serde_json::from_value(serde_json::json!({"campaignId": "c1"})).unwrap();
        assert!(!job.resume);
        assert!(job.user_id.is_none());
    }

    #[test]
    fn test_media_type_parse() {
        assert_eq!("photo".parse::<MediaType>().unwrap(), MediaType::Photo);
        assert!("gif".parse::<MediaType>().is_err());
    }
}
