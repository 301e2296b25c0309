//! Durable synchronization state.
//!
//! One row per observed message, keyed by the mail store's internal
//! identifier. The `sync_status` column is the single source of truth for
//! what happens next with a record: failures are recorded as state
//! transitions plus `last_error`, never as propagated panics. Scalar
//! checkpoints and the unresolvable-anchor cache live in the same
//! database file so a single fsync covers all of them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Retry delays, indexed by `retry_count - 1`; the last entry repeats.
const BACKOFF_SECS: [i64; 5] = [60, 300, 900, 3600, 7200];

/// Checkpoint key for the radar's high-water mark.
const KEY_LAST_MAX_ROW_ID: &str = "last_max_row_id";

/// State store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("unknown sync status: {0}")]
    UnknownStatus(String),

    #[error("invalid timestamp in store: {0}")]
    InvalidTimestamp(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Lifecycle state of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Detected by the radar, content not yet fetched.
    Pending,
    /// Scripting-channel fetch failed; scheduled for retry.
    FetchFailed,
    /// Content fetched, projection not yet attempted or deferred.
    Fetched,
    /// Terminal success; a remote page exists.
    Synced,
    /// Projection failed; scheduled for retry.
    Failed,
    /// Terminal; received before the sync horizon.
    Skipped,
    /// Terminal; retries exhausted, waiting for operator review.
    DeadLetter,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::FetchFailed => "fetch_failed",
            SyncStatus::Fetched => "fetched",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Skipped => "skipped",
            SyncStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "pending" => Ok(SyncStatus::Pending),
            "fetch_failed" => Ok(SyncStatus::FetchFailed),
            "fetched" => Ok(SyncStatus::Fetched),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            "skipped" => Ok(SyncStatus::Skipped),
            "dead_letter" => Ok(SyncStatus::DeadLetter),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }

}

/// Metadata row produced by the radar when a message first appears.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub internal_id: i64,
    pub subject: String,
    pub sender_address: String,
    pub sender_display: Option<String>,
    pub date_received: DateTime<Utc>,
    pub is_read: bool,
    pub is_flagged: bool,
    pub mailbox: String,
}

/// Authoritative header summary returned by the fetcher. Where these
/// values disagree with the radar's index metadata, these win.
#[derive(Debug, Clone)]
pub struct HeaderSummary {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender_address: String,
    pub sender_display: Option<String>,
    pub to_list: String,
    pub cc_list: String,
    pub date: DateTime<Utc>,
    pub is_read: bool,
    pub is_flagged: bool,
}

/// One observed message, from first sighting through its terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub internal_id: i64,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender_address: String,
    pub sender_display: Option<String>,
    pub to_list: String,
    pub cc_list: String,
    pub date_received: DateTime<Utc>,
    pub mailbox: String,
    pub is_read: bool,
    pub is_flagged: bool,
    pub has_attachments: bool,
    pub sync_status: SyncStatus,
    pub remote_page_id: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Message record store backed by a single SQLite file.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (creating if necessary) the state database at `path`.
    pub async fn new(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Migration(format!("create state dir: {}", e)))?;
            }
        }

        let url = format!("sqlite://{}", path.display());
        if !sqlx::Sqlite::database_exists(&url).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(&url)
                .await
                .map_err(|e| StoreError::Migration(format!("create database: {}", e)))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn new_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                internal_id INTEGER PRIMARY KEY,
                message_id TEXT UNIQUE,
                thread_id TEXT,
                subject TEXT NOT NULL DEFAULT '',
                sender_address TEXT NOT NULL DEFAULT '',
                sender_display TEXT,
                to_list TEXT NOT NULL DEFAULT '',
                cc_list TEXT NOT NULL DEFAULT '',
                date_received TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_flagged INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                remote_page_id TEXT,
                last_error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS unresolvable_anchors (
                thread_id TEXT PRIMARY KEY,
                noted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(sync_status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(message_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_next_retry ON messages(next_retry_at)",
        )
        .execute(&self.pool)
        .await?;

        debug!("state store tables ready");
        Ok(())
    }

    /// Insert a freshly detected record. Idempotent: an existing
    /// `internal_id` is left untouched.
    pub async fn upsert_on_detect(&self, meta: &NewMessage) -> StoreResult<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (internal_id, subject, sender_address, sender_display,
                 date_received, mailbox, is_read, is_flagged,
                 sync_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(meta.internal_id)
        .bind(&meta.subject)
        .bind(&meta.sender_address)
        .bind(&meta.sender_display)
        .bind(meta.date_received.to_rfc3339())
        .bind(&meta.mailbox)
        .bind(meta.is_read)
        .bind(meta.is_flagged)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            debug!(internal_id = meta.internal_id, mailbox = %meta.mailbox, "detected message");
        }
        Ok(inserted)
    }

    /// Overwrite header-derived columns with the fetcher's authoritative
    /// summary and move the record to `fetched`. Leaving a `*_failed`
    /// state clears `next_retry_at`.
    pub async fn update_after_fetch(
        &self,
        internal_id: i64,
        summary: &HeaderSummary,
        has_attachments: bool,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET message_id = ?,
                thread_id = ?,
                subject = ?,
                sender_address = ?,
                sender_display = ?,
                to_list = ?,
                cc_list = ?,
                date_received = ?,
                is_read = ?,
                is_flagged = ?,
                has_attachments = ?,
                sync_status = 'fetched',
                next_retry_at = NULL,
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(&summary.message_id)
        .bind(&summary.thread_id)
        .bind(&summary.subject)
        .bind(&summary.sender_address)
        .bind(&summary.sender_display)
        .bind(&summary.to_list)
        .bind(&summary.cc_list)
        .bind(summary.date.to_rfc3339())
        .bind(summary.is_read)
        .bind(summary.is_flagged)
        .bind(has_attachments)
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal success.
    pub async fn mark_synced(&self, internal_id: i64, remote_page_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET sync_status = 'synced',
                remote_page_id = ?,
                last_error = NULL,
                next_retry_at = NULL,
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(remote_page_id)
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await?;
        debug!(internal_id, remote_page_id, "marked synced");
        Ok(())
    }

    /// Record a fetch failure and schedule the retry, or dead-letter the
    /// record once `max_retries` is reached.
    pub async fn mark_fetch_failed(
        &self,
        internal_id: i64,
        reason: &str,
        max_retries: u32,
    ) -> StoreResult<()> {
        self.mark_failure(internal_id, reason, max_retries, SyncStatus::FetchFailed)
            .await
    }

    /// Record a projection (or parse) failure; same retry schedule.
    pub async fn mark_failed(
        &self,
        internal_id: i64,
        reason: &str,
        max_retries: u32,
    ) -> StoreResult<()> {
        self.mark_failure(internal_id, reason, max_retries, SyncStatus::Failed)
            .await
    }

    async fn mark_failure(
        &self,
        internal_id: i64,
        reason: &str,
        max_retries: u32,
        status: SyncStatus,
    ) -> StoreResult<()> {
        let row = sqlx::query("SELECT retry_count FROM messages WHERE internal_id = ?")
            .bind(internal_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            warn!(internal_id, "mark_failure on unknown record");
            return Ok(());
        };
        let retry_count: i64 = row.get("retry_count");
        let retry_count = retry_count as u32 + 1;
        let now = Utc::now();

        if retry_count >= max_retries {
            sqlx::query(
                r#"
                UPDATE messages
                SET sync_status = 'dead_letter',
                    last_error = ?,
                    retry_count = ?,
                    next_retry_at = NULL,
                    updated_at = ?
                WHERE internal_id = ?
                "#,
            )
            .bind(reason)
            .bind(retry_count)
            .bind(now.to_rfc3339())
            .bind(internal_id)
            .execute(&self.pool)
            .await?;
            warn!(internal_id, retry_count, reason, "record dead-lettered");
            return Ok(());
        }

        let delay = BACKOFF_SECS[(retry_count as usize - 1).min(BACKOFF_SECS.len() - 1)];
        let next_retry = now + ChronoDuration::seconds(delay);
        sqlx::query(
            r#"
            UPDATE messages
            SET sync_status = ?,
                last_error = ?,
                retry_count = ?,
                next_retry_at = ?,
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(retry_count)
        .bind(next_retry.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await?;
        info!(
            internal_id,
            retry_count,
            delay_s = delay,
            status = status.as_str(),
            reason,
            "retry scheduled"
        );
        Ok(())
    }

    /// Terminal skip, used for messages older than the sync horizon.
    pub async fn mark_skipped(&self, internal_id: i64, reason: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET sync_status = 'skipped',
                last_error = ?,
                next_retry_at = NULL,
                updated_at = ?
            WHERE internal_id = ?
            "#,
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await?;
        debug!(internal_id, reason, "marked skipped");
        Ok(())
    }

    /// Records whose retry time has arrived, earliest first.
    pub async fn ready_for_retry(&self, limit: u32) -> StoreResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE sync_status IN ('fetch_failed', 'failed')
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Records fetched but not yet projected, in detection order.
    pub async fn fetched_pending(&self) -> StoreResult<Vec<MessageRecord>> {
        self.by_status(SyncStatus::Fetched).await
    }

    /// Freshly detected records, in detection order.
    pub async fn pending(&self) -> StoreResult<Vec<MessageRecord>> {
        self.by_status(SyncStatus::Pending).await
    }

    async fn by_status(&self, status: SyncStatus) -> StoreResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE sync_status = ? ORDER BY internal_id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn get(&self, internal_id: i64) -> StoreResult<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE internal_id = ?")
            .bind(internal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> StoreResult<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Remove a record entirely (vanished message or duplicate).
    pub async fn delete(&self, internal_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM messages WHERE internal_id = ?")
            .bind(internal_id)
            .execute(&self.pool)
            .await?;
        debug!(internal_id, "record deleted");
        Ok(())
    }

    pub async fn get_last_max_row_id(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT value FROM checkpoints WHERE key = ?")
            .bind(KEY_LAST_MAX_ROW_ID)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<String, _>("value").parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Advance the radar high-water mark. The checkpoint is monotonic:
    /// writes below the current value are ignored.
    pub async fn set_last_max_row_id(&self, row_id: i64) -> StoreResult<()> {
        let current = self.get_last_max_row_id().await?;
        if row_id <= current {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO checkpoints (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(KEY_LAST_MAX_ROW_ID)
        .bind(row_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Note a thread anchor as unresolvable in the mail store so later
    /// replies short-circuit straight to the fallback anchor.
    pub async fn remember_unresolvable_anchor(&self, thread_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO unresolvable_anchors (thread_id, noted_at) VALUES (?, ?)",
        )
        .bind(thread_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_unresolvable_anchor(&self, thread_id: &str) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM unresolvable_anchors WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Record counts per status, for the stats subcommand.
    pub async fn counts_by_status(&self) -> StoreResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT sync_status, COUNT(*) AS n FROM messages GROUP BY sync_status ORDER BY sync_status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("sync_status"), r.get::<i64, _>("n")))
            .collect())
    }

    /// Dead-letter records for operator review, most recent first.
    pub async fn dead_letters(&self, limit: u32) -> StoreResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE sync_status = 'dead_letter'
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Put a dead-letter record back into the pipeline with a clean slate.
    /// Returns false when the record is not in `dead_letter`.
    pub async fn requeue_dead_letter(&self, internal_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET sync_status = 'pending',
                retry_count = 0,
                last_error = NULL,
                next_retry_at = NULL,
                updated_at = ?
            WHERE internal_id = ? AND sync_status = 'dead_letter'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(internal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(value.to_string()))
}

fn record_from_row(row: &SqliteRow) -> StoreResult<MessageRecord> {
    let status: String = row.get("sync_status");
    let next_retry_at: Option<String> = row.get("next_retry_at");
    Ok(MessageRecord {
        internal_id: row.get("internal_id"),
        message_id: row.get("message_id"),
        thread_id: row.get("thread_id"),
        subject: row.get("subject"),
        sender_address: row.get("sender_address"),
        sender_display: row.get("sender_display"),
        to_list: row.get("to_list"),
        cc_list: row.get("cc_list"),
        date_received: parse_timestamp(&row.get::<String, _>("date_received"))?,
        mailbox: row.get("mailbox"),
        is_read: row.get("is_read"),
        is_flagged: row.get("is_flagged"),
        has_attachments: row.get("has_attachments"),
        sync_status: SyncStatus::parse(&status)?,
        remote_page_id: row.get("remote_page_id"),
        last_error: row.get("last_error"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        next_retry_at: next_retry_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
