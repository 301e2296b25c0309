//! End-to-end pipeline cycles against a mock mail source and a mock
//! remote database, with a real state store and a real (fake) mail index.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use despacho::config::Config;
use despacho::mail::fetcher::{FetchError, FetchOutcome, FetchedMessage, MailSource};
use despacho::mail::radar::Radar;
use despacho::notion::client::{NotionApi, NotionError};
use despacho::notion::projector::FALLBACK_ANCHOR_MESSAGE_ID;
use despacho::scheduler::Scheduler;
use despacho::state::{HeaderSummary, StateStore, SyncStatus};

// ---------------------------------------------------------------------------
// Mock mail source

#[derive(Default)]
struct MockMail {
    /// internal id -> message source
    by_id: Mutex<HashMap<i64, String>>,
    /// message id -> source, for anchor lookups by string id
    by_message_id: Mutex<HashMap<String, String>>,
    /// ids that currently fail with a timeout
    failing: Mutex<HashSet<i64>>,
}

impl MockMail {
    fn add(&self, internal_id: i64, message_id: &str, source: &str) {
        self.by_id
            .lock()
            .unwrap()
            .insert(internal_id, source.to_string());
        self.by_message_id
            .lock()
            .unwrap()
            .insert(message_id.to_string(), source.to_string());
    }

    fn fail(&self, internal_id: i64) {
        self.failing.lock().unwrap().insert(internal_id);
    }

    fn recover(&self, internal_id: i64) {
        self.failing.lock().unwrap().remove(&internal_id);
    }

    fn outcome_from_source(source: &str) -> FetchOutcome {
        let message_id = source
            .lines()
            .find_map(|l| l.strip_prefix("Message-ID: "))
            .map(|v| v.trim().trim_matches(['<', '>']).to_string())
            .unwrap_or_default();
        let subject = source
            .lines()
            .find_map(|l| l.strip_prefix("Subject: "))
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        FetchOutcome::Fetched(Box::new(FetchedMessage {
            summary: HeaderSummary {
                message_id,
                thread_id: None,
                subject,
                sender_address: "a@x".to_string(),
                sender_display: Some("Alice".to_string()),
                to_list: "me@example.com".to_string(),
                cc_list: String::new(),
                date: Utc::now(),
                is_read: false,
                is_flagged: false,
            },
            source: source.as_bytes().to_vec(),
        }))
    }
}

#[async_trait]
impl MailSource for MockMail {
    async fn fetch_by_id(
        &self,
        internal_id: i64,
        _mailbox: &str,
    ) -> Result<FetchOutcome, FetchError> {
        if self.failing.lock().unwrap().contains(&internal_id) {
            return Err(FetchError::Timeout(200));
        }
        match self.by_id.lock().unwrap().get(&internal_id) {
            Some(source) => Ok(Self::outcome_from_source(source)),
            None => Ok(FetchOutcome::Vanished),
        }
    }

    async fn fetch_by_message_id(
        &self,
        message_id: &str,
        _mailbox: &str,
    ) -> Result<FetchOutcome, FetchError> {
        match self.by_message_id.lock().unwrap().get(message_id) {
            Some(source) => Ok(Self::outcome_from_source(source)),
            None => Ok(FetchOutcome::Vanished),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock remote database

struct MockPage {
    id: String,
    database_id: String,
    properties: Value,
    children: Vec<Value>,
}

#[derive(Default)]
struct MockNotionState {
    pages: Vec<MockPage>,
    next_page: u32,
    next_upload: u32,
    writes: u32,
}

#[derive(Default)]
struct MockNotion {
    state: Mutex<MockNotionState>,
}

impl MockNotion {
    fn writes(&self) -> u32 {
        self.state.lock().unwrap().writes
    }

    fn pages_in(&self, database_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .filter(|p| p.database_id == database_id)
            .count()
    }

    fn find_text(&self, database_id: &str, property: &str, value: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .find(|p| {
                p.database_id == database_id
                    && p.properties[property]["rich_text"][0]["text"]["content"]
                        .as_str()
                        .map(|v| v == value)
                        .unwrap_or(false)
            })
            .map(|p| p.id.clone())
    }

    fn page_property(&self, page_id: &str, property: &str) -> Value {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .find(|p| p.id == page_id)
            .map(|p| p.properties[property].clone())
            .unwrap_or(Value::Null)
    }
}

#[async_trait]
impl NotionApi for MockNotion {
    async fn create_page(
        &self,
        database_id: &str,
        properties: Value,
        children: Vec<Value>,
    ) -> Result<String, NotionError> {
        let mut state = self.state.lock().unwrap();
        state.next_page += 1;
        state.writes += 1;
        let id = format!("page-{}", state.next_page);
        state.pages.push(MockPage {
            id: id.clone(),
            database_id: database_id.to_string(),
            properties,
            children,
        });
        Ok(id)
    }

    async fn update_page(&self, page_id: &str, properties: Value) -> Result<(), NotionError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let page = state
            .pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .expect("update of unknown page");
        if let (Some(existing), Some(new)) = (page.properties.as_object_mut(), properties.as_object())
        {
            for (key, value) in new {
                existing.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn append_children(
        &self,
        page_id: &str,
        mut children: Vec<Value>,
    ) -> Result<(), NotionError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let page = state
            .pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .expect("append to unknown page");
        page.children.append(&mut children);
        Ok(())
    }

    async fn find_page_by_text(
        &self,
        database_id: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<String>, NotionError> {
        Ok(self.find_text(database_id, property, value))
    }

    async fn upload_file(&self, _path: &Path, _filename: &str) -> Result<String, NotionError> {
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        state.writes += 1;
        Ok(format!("upload-{}", state.next_upload))
    }
}

// ---------------------------------------------------------------------------
// Fixtures

const EMAIL_DB: &str = "email-db";
const CALENDAR_DB: &str = "cal-db";

fn plain_source(message_id: &str, subject: &str) -> String {
    format!(
        concat!(
            "From: Alice <a@x>\r\n",
            "To: me@example.com\r\n",
            "Subject: {subject}\r\n",
            "Message-ID: <{id}>\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "hello there\r\n",
        ),
        subject = subject,
        id = message_id,
    )
}

fn reply_source(message_id: &str, anchor: &str) -> String {
    format!(
        concat!(
            "From: Alice <a@x>\r\n",
            "Subject: Re: hello\r\n",
            "Message-ID: <{id}>\r\n",
            "In-Reply-To: <{anchor}>\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "replying\r\n",
        ),
        id = message_id,
        anchor = anchor,
    )
}

fn invite_source(message_id: &str, uid: &str, title: &str) -> String {
    format!(
        concat!(
            "From: organizer@x\r\n",
            "Subject: Invitation: {title}\r\n",
            "Message-ID: <{id}>\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "You are invited.\r\n",
            "--b1\r\n",
            "Content-Type: text/calendar; method=REQUEST\r\n",
            "\r\n",
            "BEGIN:VCALENDAR\r\n",
            "METHOD:REQUEST\r\n",
            "BEGIN:VEVENT\r\n",
            "UID:{uid}\r\n",
            "SUMMARY:{title}\r\n",
            "DTSTART:20250602T090000Z\r\n",
            "DTEND:20250602T100000Z\r\n",
            "END:VEVENT\r\n",
            "END:VCALENDAR\r\n",
            "--b1--\r\n",
        ),
        id = message_id,
        uid = uid,
        title = title,
    )
}

struct IndexRow {
    row_id: i64,
    subject: &'static str,
    mailbox_url: &'static str,
}

async fn build_index(path: &Path, rows: &[IndexRow]) {
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
    sqlx::query("CREATE TABLE addresses (ROWID INTEGER PRIMARY KEY, address TEXT, comment TEXT)")
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
            subject INTEGER, sender INTEGER, mailbox INTEGER,
            date_received INTEGER,
            "read" INTEGER DEFAULT 0, flagged INTEGER DEFAULT 0,
            deleted INTEGER DEFAULT 0
        )"#,
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query("INSERT INTO addresses VALUES (1, 'a@x', 'Alice')")
        .execute(&pool)
        .await
        .unwrap();

    let mut mailbox_ids: HashMap<&str, i64> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        let subject_id = (i + 1) as i64;
        sqlx::query("INSERT INTO subjects VALUES (?, ?)")
            .bind(subject_id)
            .bind(row.subject)
            .execute(&pool)
            .await
            .unwrap();

        let next_mailbox = (mailbox_ids.len() + 1) as i64;
        let mailbox_id = *mailbox_ids.entry(row.mailbox_url).or_insert(next_mailbox);
        sqlx::query("INSERT OR IGNORE INTO mailboxes VALUES (?, ?)")
            .bind(mailbox_id)
            .bind(row.mailbox_url)
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO messages (ROWID, subject, sender, mailbox, date_received) VALUES (?, ?, 1, ?, ?)",
        )
        .bind(row.row_id)
        .bind(subject_id)
        .bind(mailbox_id)
        .bind(1_748_800_000_i64 + row.row_id)
        .execute(&pool)
        .await
        .unwrap();
    }
    pool.close().await;
}

struct Harness {
    _dir: tempfile::TempDir,
    state_db: PathBuf,
    store: StateStore,
    scheduler: Scheduler,
    notion: Arc<MockNotion>,
    mail: Arc<MockMail>,
    _shutdown_tx: tokio::sync::watch::Sender<bool>,
}

async fn harness(rows: &[IndexRow], with_calendar: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("index.db");
    build_index(&index_path, rows).await;

    let state_db = dir.path().join("state.db");
    let config = Arc::new(Config {
        notion_token: "secret".to_string(),
        email_database_id: EMAIL_DB.to_string(),
        calendar_database_id: with_calendar.then(|| CALENDAR_DB.to_string()),
        user_email: "me@example.com".to_string(),
        mail_account_name: "Exchange".to_string(),
        sync_mailboxes: vec!["INBOX".to_string(), "Sent".to_string()],
        sync_start_date: None,
        poll_interval_s: 5,
        script_timeout_s: 200,
        init_batch_size: 50,
        max_attachment_bytes: 20 * 1024 * 1024,
        allowed_attachment_exts: vec![".pdf".to_string(), ".png".to_string()],
        max_retries: 5,
        state_db_path: state_db.clone(),
        mail_index_path: Some(index_path.clone()),
    });

    let store = StateStore::new(&state_db).await.unwrap();
    let radar = Radar::open(&index_path, config.sync_mailboxes.clone())
        .await
        .unwrap();
    let mail = Arc::new(MockMail::default());
    let notion = Arc::new(MockNotion::default());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler = Scheduler::new(
        Arc::clone(&config),
        store.clone(),
        radar,
        Arc::clone(&mail) as Arc<dyn MailSource>,
        Arc::clone(&notion) as Arc<dyn NotionApi>,
        shutdown_rx,
    );

    Harness {
        _dir: dir,
        state_db,
        store,
        scheduler,
        notion,
        mail,
        _shutdown_tx: shutdown_tx,
    }
}

/// Rewind a record's scheduled retry time so the next cycle picks it up.
async fn force_retry_due(state_db: &Path, internal_id: i64) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(state_db))
        .await
        .unwrap();
    sqlx::query("UPDATE messages SET next_retry_at = ? WHERE internal_id = ?")
        .bind((Utc::now() - chrono::Duration::seconds(5)).to_rfc3339())
        .bind(internal_id)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

// ---------------------------------------------------------------------------
// Scenarios

/// Fresh detection of a plain email ends synced with one page and an
/// advanced checkpoint.
#[tokio::test]
async fn fresh_detection_syncs_one_page() {
    let mut h = harness(
        &[IndexRow {
            row_id: 100,
            subject: "hello",
            mailbox_url: "imap://u@h/INBOX",
        }],
        false,
    )
    .await;
    h.mail.add(100, "m1@x", &plain_source("m1@x", "hello"));

    h.scheduler.run_once().await;

    let record = h.store.get(100).await.unwrap().expect("record exists");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.message_id.as_deref(), Some("m1@x"));
    assert!(record.thread_id.is_none());
    assert!(record.remote_page_id.is_some());
    assert_eq!(h.store.get_last_max_row_id().await.unwrap(), 100);

    let page_id = h.notion.find_text(EMAIL_DB, "Message ID", "m1@x").unwrap();
    assert_eq!(record.remote_page_id.as_deref(), Some(page_id.as_str()));
    // A root message has no parent relation.
    assert_eq!(h.notion.page_property(&page_id, "Parent Item"), Value::Null);
}

/// Replaying cycles with no new mail produces no remote writes.
#[tokio::test]
async fn idempotent_rerun_makes_no_remote_writes() {
    let mut h = harness(
        &[IndexRow {
            row_id: 100,
            subject: "hello",
            mailbox_url: "imap://u@h/INBOX",
        }],
        false,
    )
    .await;
    h.mail.add(100, "m1@x", &plain_source("m1@x", "hello"));

    h.scheduler.run_once().await;
    let writes_after_first = h.notion.writes();
    assert!(writes_after_first > 0);

    h.scheduler.run_once().await;
    h.scheduler.run_once().await;
    assert_eq!(h.notion.writes(), writes_after_first);
}

/// A reply whose anchor is gone from the mail store attaches to the
/// fallback anchor page, and the anchor enters the negative cache.
#[tokio::test]
async fn orphan_reply_attaches_to_fallback_anchor() {
    let mut h = harness(
        &[IndexRow {
            row_id: 101,
            subject: "Re: hello",
            mailbox_url: "imap://u@h/INBOX",
        }],
        false,
    )
    .await;
    h.mail.add(101, "r1@x", &reply_source("r1@x", "anchor@x"));

    h.scheduler.run_once().await;

    let record = h.store.get(101).await.unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.thread_id.as_deref(), Some("anchor@x"));
    assert!(h.store.is_unresolvable_anchor("anchor@x").await.unwrap());

    let fallback = h
        .notion
        .find_text(EMAIL_DB, "Message ID", FALLBACK_ANCHOR_MESSAGE_ID)
        .expect("fallback anchor page created");
    let reply_page = h.notion.find_text(EMAIL_DB, "Message ID", "r1@x").unwrap();
    let parent = h.notion.page_property(&reply_page, "Parent Item");
    assert_eq!(parent["relation"][0]["id"], fallback);
}

/// Anchor and reply in the same cycle: the anchor (lower internal id) is
/// projected first and the reply links to its page.
#[tokio::test]
async fn anchor_and_reply_in_same_cycle_link_correctly() {
    let mut h = harness(
        &[
            IndexRow {
                row_id: 200,
                subject: "hello",
                mailbox_url: "imap://u@h/INBOX",
            },
            IndexRow {
                row_id: 201,
                subject: "Re: hello",
                mailbox_url: "imap://u@h/INBOX",
            },
        ],
        false,
    )
    .await;
    h.mail.add(200, "a@x", &plain_source("a@x", "hello"));
    h.mail.add(201, "b@x", &reply_source("b@x", "a@x"));

    h.scheduler.run_once().await;
    // The reply may have been deferred behind its anchor; one more cycle
    // settles it either way.
    h.scheduler.run_once().await;

    let anchor_page = h.notion.find_text(EMAIL_DB, "Message ID", "a@x").unwrap();
    let reply_page = h.notion.find_text(EMAIL_DB, "Message ID", "b@x").unwrap();
    let parent = h.notion.page_property(&reply_page, "Parent Item");
    assert_eq!(parent["relation"][0]["id"], anchor_page);
    assert_ne!(anchor_page, reply_page);
    assert!(!h.store.is_unresolvable_anchor("a@x").await.unwrap());
}

/// An anchor that predates observation but is still in the mail store is
/// projected on demand through the rare string-id lookup.
#[tokio::test]
async fn unobserved_anchor_is_projected_on_demand() {
    let mut h = harness(
        &[IndexRow {
            row_id: 301,
            subject: "Re: old thread",
            mailbox_url: "imap://u@h/INBOX",
        }],
        false,
    )
    .await;
    // The anchor has no index row (it predates the watch) but the mail
    // store still has it.
    h.mail
        .by_message_id
        .lock()
        .unwrap()
        .insert("old@x".to_string(), plain_source("old@x", "old thread"));
    h.mail.add(301, "r2@x", &reply_source("r2@x", "old@x"));

    h.scheduler.run_once().await;

    let anchor_page = h.notion.find_text(EMAIL_DB, "Message ID", "old@x").unwrap();
    let reply_page = h.notion.find_text(EMAIL_DB, "Message ID", "r2@x").unwrap();
    let parent = h.notion.page_property(&reply_page, "Parent Item");
    assert_eq!(parent["relation"][0]["id"], anchor_page);
    // The anchor page exists remotely but has no local record; the
    // negative cache stays clean.
    assert!(!h.store.is_unresolvable_anchor("old@x").await.unwrap());
}

/// Fetch timeout schedules a retry; after the backoff elapses and the
/// channel recovers, the record walks fetch_failed → fetched → synced.
#[tokio::test]
async fn fetch_timeout_then_recovery() {
    let mut h = harness(
        &[IndexRow {
            row_id: 300,
            subject: "slow",
            mailbox_url: "imap://u@h/INBOX",
        }],
        false,
    )
    .await;
    h.mail.add(300, "s1@x", &plain_source("s1@x", "slow"));
    h.mail.fail(300);

    h.scheduler.run_once().await;
    let record = h.store.get(300).await.unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::FetchFailed);
    assert_eq!(record.retry_count, 1);
    let delay = record.next_retry_at.unwrap() - Utc::now();
    assert!(delay > chrono::Duration::seconds(50));
    assert!(delay <= chrono::Duration::seconds(62));

    // Still failing: the retry is not due yet, so nothing changes.
    h.scheduler.run_once().await;
    assert_eq!(h.store.get(300).await.unwrap().unwrap().retry_count, 1);

    h.mail.recover(300);
    force_retry_due(&h.state_db, 300).await;
    h.scheduler.run_once().await;

    let record = h.store.get(300).await.unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert!(h.notion.find_text(EMAIL_DB, "Message ID", "s1@x").is_some());
}

/// The same Message-ID observed under two internal ids (two mailboxes)
/// ends with exactly one page and one record.
#[tokio::test]
async fn duplicate_message_across_mailboxes_keeps_one_page() {
    let mut h = harness(
        &[
            IndexRow {
                row_id: 500,
                subject: "hello",
                mailbox_url: "imap://u@h/INBOX",
            },
            IndexRow {
                row_id: 501,
                subject: "hello",
                mailbox_url: "imap://u@h/Sent",
            },
        ],
        false,
    )
    .await;
    let source = plain_source("dup@x", "hello");
    h.mail.add(500, "dup@x", &source);
    h.mail.by_id.lock().unwrap().insert(501, source.clone());

    h.scheduler.run_once().await;

    // One synced record survives, the duplicate is gone.
    assert!(h.store.get(500).await.unwrap().is_some());
    assert!(h.store.get(501).await.unwrap().is_none());

    let email_pages: usize = h.notion.pages_in(EMAIL_DB);
    assert_eq!(email_pages, 1);
}

/// A vanished message is deleted rather than retried forever.
#[tokio::test]
async fn vanished_message_record_is_deleted() {
    let mut h = harness(
        &[IndexRow {
            row_id: 700,
            subject: "ghost",
            mailbox_url: "imap://u@h/INBOX",
        }],
        false,
    )
    .await;
    // No mock entry for 700: the scripting channel reports NOT_FOUND.

    h.scheduler.run_once().await;
    assert!(h.store.get(700).await.unwrap().is_none());
    assert_eq!(h.notion.writes(), 0);
}

/// Two invitation messages with the same event uid coalesce into one
/// calendar page; the second observation updates it.
#[tokio::test]
async fn calendar_invites_coalesce_by_uid() {
    let mut h = harness(
        &[
            IndexRow {
                row_id: 400,
                subject: "Invitation: Planning",
                mailbox_url: "imap://u@h/INBOX",
            },
            IndexRow {
                row_id: 401,
                subject: "Updated: Planning v2",
                mailbox_url: "imap://u@h/INBOX",
            },
        ],
        true,
    )
    .await;
    h.mail
        .add(400, "i1@x", &invite_source("i1@x", "u1", "Planning"));
    h.mail
        .add(401, "i2@x", &invite_source("i2@x", "u1", "Planning v2"));

    h.scheduler.run_once().await;

    assert_eq!(h.notion.pages_in(CALENDAR_DB), 1);
    let page_id = h.notion.find_text(CALENDAR_DB, "Event ID", "u1").unwrap();
    let title = h.notion.page_property(&page_id, "Title");
    assert_eq!(title["title"][0]["text"]["content"], "Planning v2");

    // Both carrier emails still get their own email pages.
    assert!(h.notion.find_text(EMAIL_DB, "Message ID", "i1@x").is_some());
    assert!(h.notion.find_text(EMAIL_DB, "Message ID", "i2@x").is_some());
}
