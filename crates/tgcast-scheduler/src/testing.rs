//! Shared fixtures for worker tests: a scripted provider and a seeded campaign.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tgcast_channels::{Media, MessagingProvider, SendError, SentMessage};
use tgcast_core::types::{SEND_MESSAGE_QUEUE, StartCampaign};

use crate::delivery::{DeliveryOutcome, DeliveryWorker};
use crate::job_queue::SqliteQueue;
use crate::model::{Campaign, Channel, NewCampaign};
use crate::orchestrator::CampaignOrchestrator;
use crate::persistence::CampaignDb;
use crate::settings::DeliverySettings;
use crate::store::CampaignStore;

/// Provider that replays per-destination scripts, then succeeds.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<SendError>>>,
    broken: Mutex<HashMap<String, SendError>>,
    calls: Mutex<Vec<String>>,
    hold: AtomicBool,
    in_flight: Notify,
    released: Notify,
}

impl ScriptedProvider {
    /// Fail the next sends to `destination` with these errors, in order.
    pub fn fail_next(&self, destination: &str, errors: Vec<SendError>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(destination.to_string(), errors.into());
    }

    /// Fail every send to `destination`.
    pub fn fail_always(&self, destination: &str, error: SendError) {
        self.broken
            .lock()
            .unwrap()
            .insert(destination.to_string(), error);
    }

    /// Park the next send after it is recorded, until [`Self::release`].
    pub fn hold_next_send(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Resolves once a held send is in flight.
    pub async fn send_in_flight(&self) {
        self.in_flight.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    pub fn calls_to(&self, destination: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == destination)
            .count()
    }
}

#[async_trait]
impl MessagingProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&self) -> Result<(), SendError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn send(
        &self,
        destination: &str,
        _content: &str,
        _media: Option<Media<'_>>,
    ) -> Result<SentMessage, SendError> {
        self.calls.lock().unwrap().push(destination.to_string());
        if self.hold.swap(false, Ordering::SeqCst) {
            self.in_flight.notify_one();
            self.released.notified().await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(destination)
            .and_then(|q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        if let Some(err) = self.broken.lock().unwrap().get(destination) {
            return Err(err.clone());
        }
        Ok(SentMessage {
            id: 1,
            sent_at: Utc::now(),
        })
    }
}

/// In-memory store and queue with one QUEUED campaign over fresh channels.
pub struct Fixture {
    pub db: Arc<CampaignDb>,
    pub queue: Arc<SqliteQueue>,
    pub provider: Arc<ScriptedProvider>,
    pub channels: Vec<Channel>,
    pub campaign_id: String,
    pub settings: DeliverySettings,
}

impl Fixture {
    pub async fn new(usernames: &[&str], delivery_rate: u32, retry_limit: u32) -> Self {
        let db = Arc::new(CampaignDb::open_in_memory().unwrap());
        let channels: Vec<Channel> = usernames
            .iter()
            .map(|u| db.insert_channel(u, None).unwrap())
            .collect();
        let ids: Vec<String> = channels.iter().map(|c| c.id.clone()).collect();
        let batch = db.insert_batch("batch", &ids).unwrap();
        let template = db.insert_template("tpl", "Hello channel", None).unwrap();
        let campaign = db
            .create_campaign(&NewCampaign {
                user_id: "user-1".into(),
                name: "Test campaign".into(),
                description: None,
                batch_id: batch.id,
                template_id: template.id,
                delivery_rate,
                retry_limit,
            })
            .await
            .unwrap();

        Self {
            db,
            queue: Arc::new(SqliteQueue::open_in_memory().unwrap()),
            provider: Arc::new(ScriptedProvider::default()),
            channels,
            campaign_id: campaign.id,
            settings: DeliverySettings::default(),
        }
    }

    pub fn orchestrator(&self) -> CampaignOrchestrator {
        CampaignOrchestrator::new(self.db.clone(), self.queue.clone(), self.settings.clone())
    }

    pub fn worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(
            self.db.clone(),
            self.queue.clone(),
            self.provider.clone(),
            self.settings.clone(),
        )
    }

    pub fn start_job(&self, resume: bool) -> StartCampaign {
        StartCampaign {
            campaign_id: self.campaign_id.clone(),
            user_id: Some("user-1".into()),
            resume,
        }
    }

    pub async fn campaign(&self) -> Campaign {
        self.db.get_campaign(&self.campaign_id).await.unwrap().unwrap()
    }

    pub async fn channel_state(&self, username: &str) -> Channel {
        let id = &self.channel(username).id;
        self.db.get_channel(id).await.unwrap().unwrap()
    }

    pub fn channel(&self, username: &str) -> &Channel {
        self.channels
            .iter()
            .find(|c| c.username == username)
            .unwrap()
    }

    /// Poll and process deliveries with a simulated clock until the queue is empty.
    pub async fn drain(&self, worker: &DeliveryWorker) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        let mut clock = Utc::now();
        for _ in 0..200 {
            clock += TimeDelta::minutes(10);
            let jobs = self.queue.poll_at(SEND_MESSAGE_QUEUE, 10, clock).unwrap();
            if jobs.is_empty() {
                let stats = self.queue.stats(SEND_MESSAGE_QUEUE).unwrap();
                if stats.pending() == 0 && stats.active == 0 {
                    break;
                }
                continue;
            }
            outcomes.extend(worker.process_batch(jobs).await);
        }
        outcomes
    }
}
