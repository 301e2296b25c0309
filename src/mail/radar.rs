//! Change detection over the mail store's index database.
//!
//! The radar never touches message bodies and never scans a mailbox
//! through the scripting channel. It samples the index's maximum row
//! identifier and, when that grows, projects the minimum metadata columns
//! for the new rows. The index file belongs to the mail application and
//! may be written concurrently, so every connection here is read-only
//! with a short busy timeout and a small retry budget for transient lock
//! contention.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mail::mailbox;
use crate::state::NewMessage;

/// Attempts per query before giving up on a locked index.
const LOCK_RETRY_ATTEMPTS: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum RadarError {
    #[error("index database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("mail index not found; looked under {0}")]
    IndexNotFound(PathBuf),
}

/// Result of one detection sweep. `max_row_id` is the highest row
/// identifier scanned (before mailbox filtering) so the caller can
/// advance its checkpoint past rows it will never care about.
#[derive(Debug)]
pub struct RadarSweep {
    pub rows: Vec<NewMessage>,
    pub max_row_id: i64,
}

/// Read-only observer of the mail store's index.
pub struct Radar {
    pool: SqlitePool,
    mailboxes: Vec<String>,
}

impl Radar {
    /// Open the index at `index_path`, monitoring the given mailbox names.
    pub async fn open(index_path: &Path, mailboxes: Vec<String>) -> Result<Self, RadarError> {
        let options = SqliteConnectOptions::new()
            .filename(index_path)
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!(path = %index_path.display(), ?mailboxes, "radar connected to mail index");
        Ok(Self { pool, mailboxes })
    }

    /// Locate the newest Envelope Index under the user's mail directory
    /// (`~/Library/Mail/V*/MailData/Envelope Index`).
    pub fn discover_index_path() -> Option<PathBuf> {
        let mail_base = dirs::home_dir()?.join("Library").join("Mail");
        let mut versions: Vec<(u32, PathBuf)> = std::fs::read_dir(&mail_base)
            .ok()?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().into_string().ok()?;
                let version = name.strip_prefix('V')?.parse::<u32>().ok()?;
                Some((version, entry.path()))
            })
            .collect();
        versions.sort_by_key(|(v, _)| *v);
        let (_, newest) = versions.pop()?;
        let index = newest.join("MailData").join("Envelope Index");
        index.exists().then_some(index)
    }

    /// Single indexed query for the current maximum row identifier.
    pub async fn current_max_row_id(&self) -> Result<i64, RadarError> {
        let mut last_err = None;
        for attempt in 0..LOCK_RETRY_ATTEMPTS {
            match self.query_max_row_id().await {
                Ok(id) => return Ok(id),
                Err(e) if is_busy(&e) && attempt + 1 < LOCK_RETRY_ATTEMPTS => {
                    warn!(attempt, "mail index busy, retrying max-row query");
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(RadarError::Database(e)),
            }
        }
        Err(RadarError::Database(last_err.expect("retry loop ran")))
    }

    async fn query_max_row_id(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT MAX(ROWID) AS max_row_id FROM messages WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("max_row_id").unwrap_or(0))
    }

    /// Metadata for not-deleted rows with `ROWID > last_max`, ascending.
    /// Rows whose decoded mailbox name is not monitored are filtered out
    /// but still advance `max_row_id`.
    pub async fn new_rows_since(
        &self,
        last_max: i64,
        limit: Option<u32>,
    ) -> Result<RadarSweep, RadarError> {
        let mut last_err = None;
        for attempt in 0..LOCK_RETRY_ATTEMPTS {
            match self.query_new_rows(last_max, limit).await {
                Ok(sweep) => return Ok(sweep),
                Err(e) if is_busy(&e) && attempt + 1 < LOCK_RETRY_ATTEMPTS => {
                    warn!(attempt, "mail index busy, retrying sweep");
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(RadarError::Database(e)),
            }
        }
        Err(RadarError::Database(last_err.expect("retry loop ran")))
    }

    async fn query_new_rows(
        &self,
        last_max: i64,
        limit: Option<u32>,
    ) -> Result<RadarSweep, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT m.ROWID AS row_id,
                   COALESCE(s.subject, '') AS subject,
                   COALESCE(a.address, '') AS sender_address,
                   a.comment AS sender_display,
                   m.date_received AS date_received,
                   m."read" AS is_read,
                   m.flagged AS is_flagged,
                   COALESCE(mb.url, '') AS mailbox_url
            FROM messages m
            LEFT JOIN subjects s ON m.subject = s.ROWID
            LEFT JOIN addresses a ON m.sender = a.ROWID
            LEFT JOIN mailboxes mb ON m.mailbox = mb.ROWID
            WHERE m.ROWID > ? AND m.deleted = 0
            ORDER BY m.ROWID ASC
            {}
            "#,
            match limit {
                Some(n) => format!("LIMIT {}", n),
                None => String::new(),
            }
        );

        let raw = sqlx::query(&sql).bind(last_max).fetch_all(&self.pool).await?;

        let mut rows = Vec::new();
        let mut max_row_id = last_max;
        for row in &raw {
            let row_id: i64 = row.get("row_id");
            max_row_id = max_row_id.max(row_id);

            let mailbox_url: String = row.get("mailbox_url");
            let Some(mailbox_name) = mailbox::name_from_url(&mailbox_url) else {
                continue;
            };
            if !self.mailboxes.iter().any(|m| m == &mailbox_name) {
                continue;
            }

            let date_secs: i64 = row.try_get("date_received").unwrap_or(0);
            let date_received: DateTime<Utc> =
                DateTime::from_timestamp(date_secs, 0).unwrap_or_else(Utc::now);

            rows.push(NewMessage {
                internal_id: row_id,
                subject: row.get("subject"),
                sender_address: row.get("sender_address"),
                sender_display: row.get("sender_display"),
                date_received,
                is_read: row.try_get::<i64, _>("is_read").unwrap_or(0) != 0,
                is_flagged: row.try_get::<i64, _>("is_flagged").unwrap_or(0) != 0,
                mailbox: mailbox_name,
            });
        }

        debug!(
            last_max,
            max_row_id,
            detected = rows.len(),
            scanned = raw.len(),
            "radar sweep complete"
        );
        Ok(RadarSweep { rows, max_row_id })
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;

    /// Build a miniature Envelope-Index-shaped database.
    async fn fake_index(path: &Path) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        sqlx::query("CREATE TABLE subjects (ROWID INTEGER PRIMARY KEY, subject TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE addresses (ROWID INTEGER PRIMARY KEY, address TEXT, comment TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE mailboxes (ROWID INTEGER PRIMARY KEY, url TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            r#"CREATE TABLE messages (
                ROWID INTEGER PRIMARY KEY,
                subject INTEGER,
                sender INTEGER,
                mailbox INTEGER,
                date_received INTEGER,
                "read" INTEGER DEFAULT 0,
                flagged INTEGER DEFAULT 0,
                deleted INTEGER DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("INSERT INTO subjects VALUES (1, 'hello'), (2, 'spam')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO addresses VALUES (1, 'a@x', 'Alice')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO mailboxes VALUES (1, 'imap://u@h/INBOX'), (2, 'imap://u@h/Junk')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"INSERT INTO messages (ROWID, subject, sender, mailbox, date_received, "read", flagged, deleted)
               VALUES (100, 1, 1, 1, 1700000000, 0, 1, 0),
                      (101, 2, 1, 2, 1700000100, 0, 0, 0),
                      (102, 1, 1, 1, 1700000200, 1, 0, 1)"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn sweep_reports_only_monitored_mailboxes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        fake_index(&path).await;

        let radar = Radar::open(&path, vec!["INBOX".to_string()]).await.unwrap();
        let sweep = radar.new_rows_since(0, None).await.unwrap();

        // Row 101 is in Junk, row 102 is deleted; only 100 remains, but the
        // watermark covers everything scanned.
        assert_eq!(sweep.rows.len(), 1);
        assert_eq!(sweep.rows[0].internal_id, 100);
        assert_eq!(sweep.rows[0].subject, "hello");
        assert_eq!(sweep.rows[0].sender_address, "a@x");
        assert_eq!(sweep.rows[0].sender_display.as_deref(), Some("Alice"));
        assert!(sweep.rows[0].is_flagged);
        assert_eq!(sweep.rows[0].mailbox, "INBOX");
        assert_eq!(sweep.max_row_id, 101);
    }

    #[tokio::test]
    async fn sweep_since_watermark_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        fake_index(&path).await;

        let radar = Radar::open(&path, vec!["INBOX".to_string()]).await.unwrap();
        let sweep = radar.new_rows_since(101, None).await.unwrap();
        assert!(sweep.rows.is_empty());
        assert_eq!(sweep.max_row_id, 101);
    }

    #[tokio::test]
    async fn max_row_id_ignores_deleted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        fake_index(&path).await;

        let radar = Radar::open(&path, vec!["INBOX".to_string()]).await.unwrap();
        assert_eq!(radar.current_max_row_id().await.unwrap(), 101);
    }

    #[tokio::test]
    async fn limit_caps_cold_start_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        fake_index(&path).await;

        let radar = Radar::open(&path, vec!["INBOX".to_string(), "Junk".to_string()])
            .await
            .unwrap();
        let sweep = radar.new_rows_since(0, Some(1)).await.unwrap();
        assert_eq!(sweep.rows.len(), 1);
        assert_eq!(sweep.max_row_id, 100);
    }
}
