//! SQLite-backed campaign store.
//! Campaigns, tasks and channel health survive restarts; every state change
//! is a single guarded UPDATE so concurrent workers never clobber each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tgcast_core::types::MediaType;
use tgcast_core::{Result, TgcastError};

use crate::model::{
    AttemptStart, Batch, Campaign, CampaignPatch, CampaignPlan, CampaignProgress, CampaignStatus, Channel,
    ChannelHealth, DeliveryTask, NewCampaign, TaskStatus, Template, progress_percent,
};
use crate::store::CampaignStore;

const CAMPAIGN_COLUMNS: &str = "id, user_id, name, description, batch_id, template_id, \
     delivery_rate, retry_limit, status, progress, total_tasks, error_message, \
     created_at, started_at, completed_at, updated_at";

const CHANNEL_COLUMNS: &str =
    "c.id, c.username, c.title, c.is_active, c.error_count, c.last_error, c.created_at";

const TASK_COLUMNS: &str = "id, campaign_id, channel_id, status, attempts, error_message, \
     created_at, started_at, sent_at, failed_at";

/// Campaign database: channels, batches, templates, campaigns and tasks.
pub struct CampaignDb {
    conn: Mutex<Connection>,
}

impl CampaignDb {
    /// Open or create the campaign database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TgcastError::Database(format!("DB open: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TgcastError::Database(format!("DB open: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
            .map_err(db_err)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TgcastError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                title TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                error_count INTEGER NOT NULL DEFAULT 0,  -- consecutive failures
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batch_channels (
                batch_id TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                PRIMARY KEY (batch_id, channel_id)
            );

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                media_type TEXT,                 -- PHOTO, VIDEO, DOCUMENT
                media_url TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                batch_id TEXT NOT NULL REFERENCES batches(id),
                template_id TEXT NOT NULL REFERENCES templates(id),
                delivery_rate INTEGER NOT NULL,  -- messages per minute
                retry_limit INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'QUEUED',
                progress INTEGER NOT NULL DEFAULT 0,
                total_tasks INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,            -- creation order within the campaign
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES channels(id),
                status TEXT NOT NULL DEFAULT 'QUEUED',
                attempts INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                sent_at TEXT,
                failed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_campaign_status ON tasks(campaign_id, status);
            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);
            ",
        )
        .map_err(|e| TgcastError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Channels, batches, templates ─────────────────────────

    pub fn insert_channel(&self, username: &str, title: Option<&str>) -> Result<Channel> {
        let channel = Channel {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            title: title.map(str::to_string),
            is_active: true,
            error_count: 0,
            last_error: None,
            created_at: Utc::now(),
        };
        let now = channel.created_at.to_rfc3339();
        self.conn()?
            .execute(
                "INSERT INTO channels (id, username, title, is_active, error_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, 0, ?4, ?4)",
                params![channel.id, channel.username, channel.title, now],
            )
            .map_err(db_err)?;
        Ok(channel)
    }

    /// Switch a channel on or off by hand. Reactivating also clears its error counter.
    pub fn set_channel_active(&self, channel_id: &str, active: bool) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE channels SET is_active = ?1, updated_at = ?2,
                    error_count = CASE WHEN ?1 = 1 THEN 0 ELSE error_count END
                 WHERE id = ?3",
                params![active as i32, Utc::now().to_rfc3339(), channel_id],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    pub fn insert_batch(&self, name: &str, channel_ids: &[String]) -> Result<Batch> {
        let batch = Batch {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO batches (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![batch.id, batch.name, batch.created_at.to_rfc3339()],
        )
        .map_err(db_err)?;
        for channel_id in channel_ids {
            tx.execute(
                "INSERT OR IGNORE INTO batch_channels (batch_id, channel_id) VALUES (?1, ?2)",
                params![batch.id, channel_id],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(batch)
    }

    pub fn insert_template(
        &self,
        name: &str,
        content: &str,
        media: Option<(MediaType, &str)>,
    ) -> Result<Template> {
        let template = Template {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            content: content.to_string(),
            media_type: media.map(|(kind, _)| kind),
            media_url: media.map(|(_, url)| url.to_string()),
            created_at: Utc::now(),
        };
        self.conn()?
            .execute(
                "INSERT INTO templates (id, name, content, media_type, media_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    template.id,
                    template.name,
                    template.content,
                    template.media_type.map(|m| m.as_str()),
                    template.media_url,
                    template.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(template)
    }

    /// All campaigns, newest first, optionally filtered by status.
    pub fn list_campaigns(&self, status: Option<CampaignStatus>) -> Result<Vec<Campaign>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns
             WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC"
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], campaign_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Every task of a campaign in creation order.
    pub fn list_tasks(&self, campaign_id: &str) -> Result<Vec<DeliveryTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE campaign_id = ?1 ORDER BY seq"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![campaign_id], task_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn counts_locked(conn: &Connection, campaign_id: &str) -> Result<CampaignProgress> {
        let status: String = conn
            .query_row(
                "SELECT status FROM campaigns WHERE id = ?1",
                params![campaign_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| TgcastError::NotFound(format!("Campaign {campaign_id}")))?;

        let mut progress = CampaignProgress {
            campaign_id: campaign_id.to_string(),
            status: status.parse().map_err(TgcastError::Database)?,
            total: 0,
            queued: 0,
            sending: 0,
            sent: 0,
            failed: 0,
            progress: 0,
        };

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks WHERE campaign_id = ?1 GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![campaign_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
            })
            .map_err(db_err)?;
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            match status.parse::<TaskStatus>().map_err(TgcastError::Database)? {
                TaskStatus::Queued => progress.queued = count,
                TaskStatus::Sending => progress.sending = count,
                TaskStatus::Sent => progress.sent = count,
                TaskStatus::Failed => progress.failed = count,
            }
        }
        progress.total = progress.queued + progress.sending + progress.sent + progress.failed;
        progress.progress = progress_percent(progress.sent, progress.failed, progress.total);
        Ok(progress)
    }
}

#[async_trait]
impl CampaignStore for CampaignDb {
    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
            params![id],
            campaign_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn load_plan(&self, campaign_id: &str) -> Result<Option<CampaignPlan>> {
        let conn = self.conn()?;
        let Some(campaign) = conn
            .query_row(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![campaign_id],
                campaign_from_row,
            )
            .optional()
            .map_err(db_err)?
        else {
            return Ok(None);
        };

        let template = conn
            .query_row(
                "SELECT id, name, content, media_type, media_url, created_at
                 FROM templates WHERE id = ?1",
                params![campaign.template_id],
                template_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| TgcastError::NotFound(format!("Template {}", campaign.template_id)))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels c
                 JOIN batch_channels bc ON bc.channel_id = c.id
                 WHERE bc.batch_id = ?1
                 ORDER BY c.created_at, c.username"
            ))
            .map_err(db_err)?;
        let channels = stmt
            .query_map(params![campaign.batch_id], channel_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        Ok(Some(CampaignPlan {
            campaign,
            template,
            channels,
        }))
    }

    async fn queued_tasks(&self, campaign_id: &str) -> Result<Vec<DeliveryTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE campaign_id = ?1 AND status = 'QUEUED' ORDER BY seq"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![campaign_id], task_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1"),
            params![id],
            channel_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn create_campaign(&self, new: &NewCampaign) -> Result<Campaign> {
        new.validate().map_err(TgcastError::Validation)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let batch_exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM batches WHERE id = ?1)",
                params![new.batch_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if !batch_exists {
            return Err(TgcastError::NotFound(format!("Batch {}", new.batch_id)));
        }
        let template_exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM templates WHERE id = ?1)",
                params![new.template_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if !template_exists {
            return Err(TgcastError::NotFound(format!("Template {}", new.template_id)));
        }

        let channel_ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT c.id FROM channels c
                     JOIN batch_channels bc ON bc.channel_id = c.id
                     WHERE bc.batch_id = ?1 AND c.is_active = 1
                     ORDER BY c.created_at, c.username",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![new.batch_id], |r| r.get(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };
        if channel_ids.is_empty() {
            return Err(TgcastError::Validation("No active channels in batch".into()));
        }

        let now = Utc::now();
        let campaign = Campaign {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new.user_id.clone(),
            name: new.name.trim().to_string(),
            description: new.description.clone(),
            batch_id: new.batch_id.clone(),
            template_id: new.template_id.clone(),
            delivery_rate: new.delivery_rate,
            retry_limit: new.retry_limit,
            status: CampaignStatus::Queued,
            progress: 0,
            total_tasks: channel_ids.len() as u32,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        let ts = now.to_rfc3339();

        tx.execute(
            "INSERT INTO campaigns (id, user_id, name, description, batch_id, template_id,
                delivery_rate, retry_limit, status, progress, total_tasks, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'QUEUED', 0, ?9, ?10, ?10)",
            params![
                campaign.id,
                campaign.user_id,
                campaign.name,
                campaign.description,
                campaign.batch_id,
                campaign.template_id,
                campaign.delivery_rate,
                campaign.retry_limit,
                campaign.total_tasks,
                ts,
            ],
        )
        .map_err(db_err)?;

        for (seq, channel_id) in channel_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO tasks (id, seq, campaign_id, channel_id, status, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'QUEUED', 0, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    seq as i64,
                    campaign.id,
                    channel_id,
                    ts,
                ],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(campaign)
    }

    async fn update_campaign(&self, id: &str, patch: &CampaignPatch) -> Result<Campaign> {
        patch.validate().map_err(TgcastError::Validation)?;

        let conn = self.conn()?;
        let mut campaign = conn
            .query_row(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id],
                campaign_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| TgcastError::NotFound(format!("Campaign {id}")))?;

        if !campaign.status.is_editable() {
            return Err(TgcastError::InvalidState(format!(
                "Campaign {id} is {} and can no longer be edited",
                campaign.status
            )));
        }

        if let Some(name) = &patch.name {
            campaign.name = name.trim().to_string();
        }
        if let Some(description) = &patch.description {
            campaign.description = Some(description.clone());
        }
        if let Some(rate) = patch.delivery_rate {
            campaign.delivery_rate = rate;
        }
        if let Some(limit) = patch.retry_limit {
            campaign.retry_limit = limit;
        }
        campaign.updated_at = Utc::now();

        let rows = conn
            .execute(
                "UPDATE campaigns SET name = ?1, description = ?2, delivery_rate = ?3,
                    retry_limit = ?4, updated_at = ?5
                 WHERE id = ?6 AND status IN ('QUEUED', 'PAUSED')",
                params![
                    campaign.name,
                    campaign.description,
                    campaign.delivery_rate,
                    campaign.retry_limit,
                    campaign.updated_at.to_rfc3339(),
                    id,
                ],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(TgcastError::InvalidState(format!(
                "Campaign {id} changed status during update"
            )));
        }
        Ok(campaign)
    }

    async fn delete_campaign(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM tasks WHERE campaign_id = ?1", params![id])
            .map_err(db_err)?;
        let rows = tx
            .execute("DELETE FROM campaigns WHERE id = ?1", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn transition_campaign(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE campaigns SET status = ?1, updated_at = ?2,
                started_at = CASE WHEN ?1 = 'RUNNING' AND started_at IS NULL THEN ?2 ELSE started_at END,
                completed_at = CASE WHEN ?1 IN ('COMPLETED', 'CANCELLED', 'FAILED') THEN ?2 ELSE completed_at END,
                error_message = CASE WHEN ?1 = 'RUNNING' THEN NULL ELSE error_message END
             WHERE id = ?3 AND status IN ({allowed})"
        );
        let rows = self
            .conn()?
            .execute(&sql, params![to.as_str(), Utc::now().to_rfc3339(), id])
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn record_campaign_error(&self, id: &str, error: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE campaigns SET error_message = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, Utc::now().to_rfc3339(), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn begin_attempt(&self, task_id: &str) -> Result<AttemptStart> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let row: Option<(String, String, u32)> = tx
            .query_row(
                "SELECT t.status, c.status, c.retry_limit
                 FROM tasks t JOIN campaigns c ON c.id = t.campaign_id
                 WHERE t.id = ?1",
                params![task_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((task_status, campaign_status, retry_limit)) = row else {
            return Ok(AttemptStart::Finished);
        };
        let task_status: TaskStatus = task_status.parse().map_err(TgcastError::Database)?;
        let campaign_status: CampaignStatus =
            campaign_status.parse().map_err(TgcastError::Database)?;

        let start = match task_status {
            TaskStatus::Sent | TaskStatus::Failed => AttemptStart::Finished,
            _ if campaign_status != CampaignStatus::Running => {
                tx.execute(
                    "UPDATE tasks SET status = 'QUEUED' WHERE id = ?1 AND status = 'SENDING'",
                    params![task_id],
                )
                .map_err(db_err)?;
                AttemptStart::Halted(campaign_status)
            }
            TaskStatus::Queued | TaskStatus::Sending => {
                let attempt: u32 = tx
                    .query_row(
                        "UPDATE tasks SET status = 'SENDING', attempts = attempts + 1, started_at = ?1
                         WHERE id = ?2
                         RETURNING attempts",
                        params![Utc::now().to_rfc3339(), task_id],
                        |r| r.get(0),
                    )
                    .map_err(db_err)?;
                AttemptStart::Started {
                    attempt,
                    retry_limit,
                    abandoned: task_status == TaskStatus::Sending,
                }
            }
        };
        tx.commit().map_err(db_err)?;
        Ok(start)
    }

    async fn mark_task_sent(&self, task_id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE tasks SET status = 'SENT', sent_at = ?1, error_message = NULL
                 WHERE id = ?2 AND status = 'SENDING'",
                params![Utc::now().to_rfc3339(), task_id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn requeue_task(&self, task_id: &str, error: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE tasks SET status = 'QUEUED', error_message = ?1
                 WHERE id = ?2 AND status = 'SENDING'",
                params![error, task_id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_task_failed(&self, task_id: &str, error: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE tasks SET status = 'FAILED', failed_at = ?1, error_message = ?2
                 WHERE id = ?3 AND status IN ('QUEUED', 'SENDING')",
                params![Utc::now().to_rfc3339(), error, task_id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_channel_failure(
        &self,
        channel_id: &str,
        error: &str,
        threshold: u32,
    ) -> Result<ChannelHealth> {
        let conn = self.conn()?;
        let was_active: bool = conn
            .query_row(
                "SELECT is_active FROM channels WHERE id = ?1",
                params![channel_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| TgcastError::NotFound(format!("Channel {channel_id}")))?;

        let (error_count, is_active): (u32, bool) = conn
            .query_row(
                "UPDATE channels SET
                    error_count = error_count + 1,
                    last_error = ?1,
                    updated_at = ?2,
                    is_active = CASE WHEN error_count + 1 >= ?3 THEN 0 ELSE is_active END
                 WHERE id = ?4
                 RETURNING error_count, is_active",
                params![error, Utc::now().to_rfc3339(), threshold, channel_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(db_err)?;

        Ok(ChannelHealth {
            error_count,
            is_active,
            deactivated: was_active && !is_active,
        })
    }

    async fn record_channel_success(&self, channel_id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE channels SET error_count = 0, last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND error_count > 0",
                params![Utc::now().to_rfc3339(), channel_id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn task_counts(&self, campaign_id: &str) -> Result<CampaignProgress> {
        let conn = self.conn()?;
        Self::counts_locked(&conn, campaign_id)
    }

    async fn recompute_progress(&self, campaign_id: &str) -> Result<CampaignProgress> {
        let conn = self.conn()?;
        let mut progress = Self::counts_locked(&conn, campaign_id)?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE campaigns SET progress = ?1, updated_at = ?2 WHERE id = ?3",
            params![progress.progress, now, campaign_id],
        )
        .map_err(db_err)?;

        if progress.progress >= 100 {
            let completed = conn
                .execute(
                    "UPDATE campaigns SET status = 'COMPLETED', completed_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND status IN ('RUNNING', 'PAUSED')",
                    params![now, campaign_id],
                )
                .map_err(db_err)?;
            if completed > 0 {
                progress.status = CampaignStatus::Completed;
                tracing::info!(
                    "🏁 Campaign {} completed: {} sent, {} failed",
                    campaign_id,
                    progress.sent,
                    progress.failed
                );
            }
        }
        Ok(progress)
    }
}

fn db_err(e: rusqlite::Error) -> TgcastError {
    TgcastError::Database(e.to_string())
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn parse_col<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    let status: String = row.get(8)?;
    Ok(Campaign {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        batch_id: row.get(4)?,
        template_id: row.get(5)?,
        delivery_rate: row.get(6)?,
        retry_limit: row.get(7)?,
        status: parse_col(8, &status)?,
        progress: row.get(9)?,
        total_tasks: row.get(10)?,
        error_message: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?),
        started_at: parse_opt_ts(row.get(13)?),
        completed_at: parse_opt_ts(row.get(14)?),
        updated_at: parse_ts(&row.get::<_, String>(15)?),
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        username: row.get(1)?,
        title: row.get(2)?,
        is_active: row.get(3)?,
        error_count: row.get(4)?,
        last_error: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<Template> {
    let media_type: Option<String> = row.get(3)?;
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        content: row.get(2)?,
        media_type: media_type.map(|m| parse_col(3, &m)).transpose()?,
        media_url: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryTask> {
    let status: String = row.get(3)?;
    Ok(DeliveryTask {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        channel_id: row.get(2)?,
        status: parse_col(3, &status)?,
        attempts: row.get(4)?,
        error_message: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?),
        started_at: parse_opt_ts(row.get(7)?),
        sent_at: parse_opt_ts(row.get(8)?),
        failed_at: parse_opt_ts(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(db: &CampaignDb, channels: usize) -> (Vec<Channel>, Batch, Template) {
        let channels: Vec<Channel> = (0..channels)
            .map(|i| db.insert_channel(&format!("@chan{i}"), None).unwrap())
            .collect();
        let ids: Vec<String> = channels.iter().map(|c| c.id.clone()).collect();
        let batch = db.insert_batch("main", &ids).unwrap();
        let template = db.insert_template("promo", "Hello!", None).unwrap();
        (channels, batch, template)
    }

    fn new_campaign(batch: &Batch, template: &Template) -> NewCampaign {
        NewCampaign {
            user_id: "u1".into(),
            name: "Launch".into(),
            description: None,
            batch_id: batch.id.clone(),
            template_id: template.id.clone(),
            delivery_rate: 20,
            retry_limit: 3,
        }
    }

    #[tokio::test]
    async fn test_create_campaign_materializes_tasks_for_active_channels() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (channels, batch, template) = seeded(&db, 3);
        db.set_channel_active(&channels[1].id, false).unwrap();

        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Queued);
        assert_eq!(campaign.total_tasks, 2);

        let tasks = db.queued_tasks(&campaign.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.channel_id != channels[1].id));
        assert!(tasks.iter().all(|t| t.attempts == 0));
    }

    #[tokio::test]
    async fn test_create_campaign_without_active_channels_fails() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (channels, batch, template) = seeded(&db, 1);
        db.set_channel_active(&channels[0].id, false).unwrap();

        let err = db
            .create_campaign(&new_campaign(&batch, &template))
            .await
            .unwrap_err();
        assert!(matches!(err, TgcastError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_campaign_unknown_batch() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 1);
        let mut new = new_campaign(&batch, &template);
        new.batch_id = "missing".into();
        assert!(matches!(
            db.create_campaign(&new).await,
            Err(TgcastError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_attempt_counts_and_guards_terminal_tasks() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 1);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();
        db.transition_campaign(&campaign.id, &[CampaignStatus::Queued], CampaignStatus::Running)
            .await
            .unwrap();
        let task = db.queued_tasks(&campaign.id).await.unwrap().remove(0);
        let started = |attempt, abandoned| AttemptStart::Started {
            attempt,
            retry_limit: campaign.retry_limit,
            abandoned,
        };

        assert_eq!(db.begin_attempt(&task.id).await.unwrap(), started(1, false));
        db.requeue_task(&task.id, "boom").await.unwrap();
        assert_eq!(db.begin_attempt(&task.id).await.unwrap(), started(2, false));
        // Claimed again without settling
        assert_eq!(db.begin_attempt(&task.id).await.unwrap(), started(3, true));

        db.mark_task_sent(&task.id).await.unwrap();
        assert_eq!(db.begin_attempt(&task.id).await.unwrap(), AttemptStart::Finished);

        let stored = db.list_tasks(&campaign.id).unwrap().remove(0);
        assert_eq!(stored.status, TaskStatus::Sent);
        assert_eq!(stored.attempts, 3);
        assert!(stored.sent_at.is_some());
        assert!(stored.error_message.is_none());
        assert_eq!(db.begin_attempt("missing").await.unwrap(), AttemptStart::Finished);
    }

    #[tokio::test]
    async fn test_begin_attempt_requires_running_campaign() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 1);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();
        let task = db.queued_tasks(&campaign.id).await.unwrap().remove(0);

        assert_eq!(
            db.begin_attempt(&task.id).await.unwrap(),
            AttemptStart::Halted(CampaignStatus::Queued)
        );

        db.transition_campaign(&campaign.id, &[CampaignStatus::Queued], CampaignStatus::Running)
            .await
            .unwrap();
        assert!(matches!(
            db.begin_attempt(&task.id).await.unwrap(),
            AttemptStart::Started { attempt: 1, .. }
        ));

        db.transition_campaign(&campaign.id, &[CampaignStatus::Running], CampaignStatus::Paused)
            .await
            .unwrap();
        assert_eq!(
            db.begin_attempt(&task.id).await.unwrap(),
            AttemptStart::Halted(CampaignStatus::Paused)
        );

        // The abandoned SENDING task is handed back for the next resume.
        let stored = db.list_tasks(&campaign.id).unwrap().remove(0);
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_channel_failure_threshold() {
        let db = CampaignDb::open_in_memory().unwrap();
        let channel = db.insert_channel("@flaky", Some("Flaky")).unwrap();

        for expected in 1..=4 {
            let health = db
                .record_channel_failure(&channel.id, "forbidden", 5)
                .await
                .unwrap();
            assert_eq!(health.error_count, expected);
            assert!(health.is_active);
            assert!(!health.deactivated);
        }

        let health = db.record_channel_failure(&channel.id, "forbidden", 5).await.unwrap();
        assert_eq!(health.error_count, 5);
        assert!(!health.is_active);
        assert!(health.deactivated);

        let health = db.record_channel_failure(&channel.id, "forbidden", 5).await.unwrap();
        assert!(!health.deactivated);

        let stored = db.get_channel(&channel.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("forbidden"));
    }

    #[tokio::test]
    async fn test_channel_success_resets_counter() {
        let db = CampaignDb::open_in_memory().unwrap();
        let channel = db.insert_channel("@ok", None).unwrap();
        db.record_channel_failure(&channel.id, "x", 5).await.unwrap();
        db.record_channel_failure(&channel.id, "x", 5).await.unwrap();
        db.record_channel_success(&channel.id).await.unwrap();

        let stored = db.get_channel(&channel.id).await.unwrap().unwrap();
        assert_eq!(stored.error_count, 0);
        assert!(stored.last_error.is_none());
        assert!(stored.is_active);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 1);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();

        assert!(
            !db.transition_campaign(&campaign.id, &[CampaignStatus::Running], CampaignStatus::Paused)
                .await
                .unwrap()
        );
        assert!(
            db.transition_campaign(&campaign.id, &[CampaignStatus::Queued], CampaignStatus::Running)
                .await
                .unwrap()
        );
        let running = db.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(running.status, CampaignStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        assert!(
            db.transition_campaign(
                &campaign.id,
                &[CampaignStatus::Running, CampaignStatus::Paused],
                CampaignStatus::Cancelled
            )
            .await
            .unwrap()
        );
        let cancelled = db.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert!(cancelled.completed_at.is_some());
        assert_eq!(cancelled.started_at, running.started_at);
    }

    #[tokio::test]
    async fn test_recompute_progress_completes_campaign() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 3);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();
        db.transition_campaign(&campaign.id, &[CampaignStatus::Queued], CampaignStatus::Running)
            .await
            .unwrap();
        let tasks = db.queued_tasks(&campaign.id).await.unwrap();

        db.begin_attempt(&tasks[0].id).await.unwrap();
        db.mark_task_sent(&tasks[0].id).await.unwrap();
        let progress = db.recompute_progress(&campaign.id).await.unwrap();
        assert_eq!(progress.progress, 33);
        assert_eq!(progress.status, CampaignStatus::Running);

        db.mark_task_failed(&tasks[1].id, "gone").await.unwrap();
        let progress = db.recompute_progress(&campaign.id).await.unwrap();
        assert_eq!(progress.progress, 66);

        db.begin_attempt(&tasks[2].id).await.unwrap();
        db.mark_task_sent(&tasks[2].id).await.unwrap();
        let progress = db.recompute_progress(&campaign.id).await.unwrap();
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.status, CampaignStatus::Completed);
        assert_eq!((progress.sent, progress.failed), (2, 1));

        let stored = db.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_recompute_progress_leaves_cancelled_alone() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 1);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();
        db.transition_campaign(&campaign.id, &[CampaignStatus::Queued], CampaignStatus::Cancelled)
            .await
            .unwrap();
        let task = db.queued_tasks(&campaign.id).await.unwrap().remove(0);
        db.mark_task_failed(&task.id, "x").await.unwrap();

        let progress = db.recompute_progress(&campaign.id).await.unwrap();
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.status, CampaignStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_update_only_when_editable() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 1);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();

        let patch = CampaignPatch {
            delivery_rate: Some(60),
            ..Default::default()
        };
        let updated = db.update_campaign(&campaign.id, &patch).await.unwrap();
        assert_eq!(updated.delivery_rate, 60);

        db.transition_campaign(&campaign.id, &[CampaignStatus::Queued], CampaignStatus::Running)
            .await
            .unwrap();
        assert!(matches!(
            db.update_campaign(&campaign.id, &patch).await,
            Err(TgcastError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_load_plan_includes_inactive_channels() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (channels, batch, template) = seeded(&db, 2);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();
        db.set_channel_active(&channels[0].id, false).unwrap();

        let plan = db.load_plan(&campaign.id).await.unwrap().unwrap();
        assert_eq!(plan.channels.len(), 2);
        assert_eq!(plan.active_channels().count(), 1);
        assert_eq!(plan.template.content, "Hello!");
        assert!(db.load_plan("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_campaign() {
        let db = CampaignDb::open_in_memory().unwrap();
        let (_, batch, template) = seeded(&db, 2);
        let campaign = db.create_campaign(&new_campaign(&batch, &template)).await.unwrap();
        assert!(db.delete_campaign(&campaign.id).await.unwrap());
        assert!(db.get_campaign(&campaign.id).await.unwrap().is_none());
        assert!(db.queued_tasks(&campaign.id).await.unwrap().is_empty());
        assert!(!db.delete_campaign(&campaign.id).await.unwrap());
    }

    #[test]
    fn test_open_file_db() {
        let dir = std::env::temp_dir().join(format!("tgcast-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("tgcast.db");
        {
            let db = CampaignDb::open(&path).unwrap();
            db.insert_channel("@persisted", None).unwrap();
        }
        let db = CampaignDb::open(&path).unwrap();
        let campaigns = db.list_campaigns(None).unwrap();
        assert!(campaigns.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
