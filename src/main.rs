//! # tgcast: Telegram campaign delivery
//!
//! Runs the campaign and delivery workers against the local SQLite store,
//! and exposes a few operator commands on the same database.
//!
//! Usage:
//!   tgcast run                              # Start workers until Ctrl-C
//!   tgcast action <campaign-id> pause       # start | pause | resume | cancel
//!   tgcast stats <campaign-id>              # Task counts and progress
//!   tgcast campaigns --status running       # List campaigns
//!   tgcast init                             # Write default config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tgcast_channels::{FloodGate, GatedProvider, MessagingProvider, TelegramProvider};
use tgcast_core::TgcastConfig;
use tgcast_scheduler::{
    CampaignAction, CampaignDb, CampaignEngine, CampaignOrchestrator, CampaignService,
    CampaignStatus, DeliverySettings, DeliveryWorker, SqliteQueue,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tgcast", version, about = "📣 tgcast: Telegram campaign delivery")]
struct Cli {
    /// Config file (default: ~/.tgcast/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the campaign and delivery workers
    Run,
    /// Apply an operator action to a campaign
    Action {
        campaign_id: String,
        action: CampaignAction,
        /// Requesting user, recorded on the orchestration job
        #[arg(long)]
        user: Option<String>,
    },
    /// Show task counts and progress of a campaign
    Stats { campaign_id: String },
    /// List campaigns
    Campaigns {
        #[arg(long)]
        status: Option<CampaignStatus>,
    },
    /// Write the default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tgcast=debug,tgcast_scheduler=debug,tgcast_channels=debug"
    } else {
        "tgcast=info,tgcast_scheduler=info,tgcast_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TgcastConfig::load_from(path)?.with_env_overrides(),
        None => TgcastConfig::load()?,
    };

    match cli.command {
        Command::Run => run(config).await,
        Command::Action {
            campaign_id,
            action,
            user,
        } => {
            let service = open_service(&config)?;
            let campaign = service
                .apply_action(&campaign_id, action, user.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&campaign)?);
            Ok(())
        }
        Command::Stats { campaign_id } => {
            let service = open_service(&config)?;
            let stats = service.campaign_stats(&campaign_id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Campaigns { status } => {
            let db = CampaignDb::open(&config.database.store_path())?;
            for campaign in db.list_campaigns(status)? {
                println!(
                    "{}  {:<9}  {:>3}%  {}",
                    campaign.id,
                    campaign.status.as_str(),
                    campaign.progress,
                    campaign.name
                );
            }
            Ok(())
        }
        Command::Init => {
            let path = TgcastConfig::default_path();
            if path.exists() {
                anyhow::bail!("Config already exists at {}", path.display());
            }
            TgcastConfig::default().save()?;
            println!("✅ Config written to {}", path.display());
            Ok(())
        }
    }
}

fn open_service(config: &TgcastConfig) -> Result<CampaignService> {
    let db = Arc::new(CampaignDb::open(&config.database.store_path())?);
    let queue = Arc::new(SqliteQueue::open(&config.database.queue_path())?);
    Ok(CampaignService::new(db, queue))
}

async fn run(config: TgcastConfig) -> Result<()> {
    if config.telegram.bot_token.is_empty() {
        anyhow::bail!(
            "Telegram bot token missing: set telegram.bot_token or {}",
            tgcast_core::config::BOT_TOKEN_ENV
        );
    }

    let store_path = config.database.store_path();
    let queue_path = config.database.queue_path();
    let db = Arc::new(CampaignDb::open(&store_path)?);
    let queue = Arc::new(SqliteQueue::open(&queue_path)?);
    tracing::info!("🗄️ Store: {}", store_path.display());
    tracing::info!("🗄️ Queue: {}", queue_path.display());

    let gate = Arc::new(FloodGate::new());
    let provider = Arc::new(GatedProvider::new(
        TelegramProvider::new(config.telegram.clone()),
        gate,
    ));
    provider
        .connect()
        .await
        .context("Failed to connect to Telegram")?;

    let settings = DeliverySettings::from(&config.delivery);
    let orchestrator = CampaignOrchestrator::new(db.clone(), queue.clone(), settings.clone());
    let worker = DeliveryWorker::new(db.clone(), queue.clone(), provider.clone(), settings);
    let engine = Arc::new(CampaignEngine::new(
        orchestrator,
        worker,
        queue,
        &config.workers,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.clone().spawn(shutdown_rx);
    tracing::info!("🚀 tgcast workers running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down...");
    shutdown_tx.send(true).ok();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("⚠️ Worker task ended abnormally: {e}");
        }
    }

    if let Err(e) = provider.disconnect().await {
        tracing::warn!("⚠️ Disconnect failed: {e}");
    }
    let stats = engine.stats();
    tracing::info!(
        "📊 Sent {}, failed {}, retried {}, halted {}",
        stats.messages_sent,
        stats.messages_failed,
        stats.messages_retried,
        stats.halted
    );
    let flood = provider.gate().stats();
    tracing::info!(
        "🌊 Flood waits: {}{}",
        flood.total_blocks,
        flood
            .blocked_for_secs
            .map(|secs| format!(", still blocked for {secs}s"))
            .unwrap_or_default()
    );
    Ok(())
}
