//! # tgcast Scheduler
//!
//! Campaign delivery for Telegram channels: expand a campaign into
//! rate-limited delivery jobs, send them through a messaging provider,
//! retry what is recoverable and keep campaign progress in step.
//!
//! ## Design Principles
//! - No external broker: the job queue is a SQLite table, like the store
//! - Workers are stateless; every decision is re-read from the store
//! - At-least-once delivery, deduplicated by per-task status
//!
//! ## Architecture
//! ```text
//! CampaignService (start / pause / resume / cancel)
//!   └── enqueue "start-campaign" ──► CampaignOrchestrator
//!                                      └── one "send-message" per task,
//!                                          spaced by delivery rate + jitter
//!                                             │
//!                                             ▼
//!                                      DeliveryWorker ──► MessagingProvider
//!                                        ├── SENT   ─► progress ─► COMPLETED at 100%
//!                                        └── error  ─► retry / FAILED, channel health
//! ```

pub mod delivery;
pub mod disposition;
pub mod engine;
pub mod job_queue;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod queue;
pub mod settings;
pub mod store;

#[cfg(test)]
mod testing;

pub use delivery::{DeliveryOutcome, DeliveryWorker};
pub use engine::{CampaignEngine, EngineStatsSnapshot};
pub use job_queue::SqliteQueue;
pub use lifecycle::CampaignService;
pub use model::{Campaign, CampaignAction, CampaignProgress, CampaignStatus, DeliveryTask, TaskStatus};
pub use orchestrator::{CampaignOrchestrator, OrchestrationError, OrchestrationReport};
pub use persistence::CampaignDb;
pub use queue::{EnqueueOptions, Job, JobState, RetryDirective, TaskQueue};
pub use settings::DeliverySettings;
pub use store::CampaignStore;
