//! Campaign engine: the two worker loops that drain the queues.
//! Each loop polls, processes, and sleeps only when it found less than a full batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tgcast_core::Result;
use tgcast_core::config::WorkerConfig;
use tgcast_core::types::{SEND_MESSAGE_QUEUE, START_CAMPAIGN_QUEUE, StartCampaign};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::delivery::{DeliveryOutcome, DeliveryWorker};
use crate::orchestrator::CampaignOrchestrator;
use crate::queue::{RetryDirective, TaskQueue};

/// Running totals since the engine started.
#[derive(Debug, Default)]
pub struct EngineStats {
    campaigns_orchestrated: AtomicU64,
    campaigns_rejected: AtomicU64,
    messages_sent: AtomicU64,
    messages_retried: AtomicU64,
    messages_failed: AtomicU64,
    duplicates: AtomicU64,
    halted: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub campaigns_orchestrated: u64,
    pub campaigns_rejected: u64,
    pub messages_sent: u64,
    pub messages_retried: u64,
    pub messages_failed: u64,
    pub duplicates: u64,
    /// Sends dropped because their campaign was no longer RUNNING.
    pub halted: u64,
    pub errors: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            campaigns_orchestrated: self.campaigns_orchestrated.load(Ordering::Relaxed),
            campaigns_rejected: self.campaigns_rejected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_retried: self.messages_retried.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            halted: self.halted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn tally(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Sent => &self.messages_sent,
            DeliveryOutcome::Retrying(_) => &self.messages_retried,
            DeliveryOutcome::Failed => &self.messages_failed,
            DeliveryOutcome::Duplicate => &self.duplicates,
            DeliveryOutcome::Halted => &self.halted,
            DeliveryOutcome::Rejected | DeliveryOutcome::Errored => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct CampaignEngine {
    orchestrator: CampaignOrchestrator,
    worker: DeliveryWorker,
    queue: Arc<dyn TaskQueue>,
    batch_size: usize,
    delivery_interval: Duration,
    campaign_interval: Duration,
    stats: EngineStats,
}

impl CampaignEngine {
    pub fn new(
        orchestrator: CampaignOrchestrator,
        worker: DeliveryWorker,
        queue: Arc<dyn TaskQueue>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            worker,
            queue,
            batch_size: config.delivery_batch_size.max(1),
            delivery_interval: Duration::from_secs(config.delivery_poll_interval_secs),
            campaign_interval: Duration::from_secs(config.campaign_poll_interval_secs),
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Take one orchestration job, if any. Returns the number of jobs handled.
    pub async fn run_campaign_tick(&self) -> Result<usize> {
        let jobs = self.queue.poll(START_CAMPAIGN_QUEUE, 1).await?;
        for job in &jobs {
            let start: StartCampaign = match job.decode() {
                Ok(start) => start,
                Err(e) => {
                    tracing::error!("❌ {}", e);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.queue.fail(&job.id, RetryDirective::Never).await?;
                    continue;
                }
            };

            match self.orchestrator.orchestrate(&start).await {
                Ok(report) => {
                    if !report.noop {
                        self.stats.campaigns_orchestrated.fetch_add(1, Ordering::Relaxed);
                    }
                    self.queue.complete(&job.id).await?;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Campaign {} not started: {}", start.campaign_id, e);
                    self.stats.campaigns_rejected.fetch_add(1, Ordering::Relaxed);
                    self.queue.fail(&job.id, RetryDirective::Never).await?;
                }
            }
        }
        Ok(jobs.len())
    }

    /// Take one batch of delivery jobs. Returns the batch size.
    pub async fn run_delivery_tick(&self) -> Result<usize> {
        let jobs = self.queue.poll(SEND_MESSAGE_QUEUE, self.batch_size).await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        let count = jobs.len();
        for outcome in self.worker.process_batch(jobs).await {
            self.stats.tally(&outcome);
        }
        Ok(count)
    }

    /// Spawn both worker loops. They stop once `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().campaign_loop(shutdown.clone())),
            tokio::spawn(self.delivery_loop(shutdown)),
        ]
    }

    async fn campaign_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("⏰ Campaign worker started (poll every {:?})", self.campaign_interval);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let busy = match self.run_campaign_tick().await {
                Ok(handled) => handled > 0,
                Err(e) => {
                    tracing::warn!("⚠️ Campaign worker tick failed: {e}");
                    false
                }
            };
            if !busy && !idle(self.campaign_interval, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("Campaign worker stopped");
    }

    async fn delivery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "📨 Delivery worker started (batch {}, poll every {:?})",
            self.batch_size,
            self.delivery_interval
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let full = match self.run_delivery_tick().await {
                Ok(count) => count >= self.batch_size,
                Err(e) => {
                    tracing::warn!("⚠️ Delivery worker tick failed: {e}");
                    false
                }
            };
            if !full && !idle(self.delivery_interval, &mut shutdown).await {
                break;
            }
        }
        tracing::info!("Delivery worker stopped");
    }
}

/// Sleep for `interval` unless shutdown arrives first. Returns false on shutdown.
async fn idle(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let changed = tokio::select! {
        _ = tokio::time::sleep(interval) => return true,
        changed = shutdown.changed() => changed,
    };
    changed.is_ok() && !*shutdown.borrow()
}
