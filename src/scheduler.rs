//! The poll loop driving the pipeline.
//!
//! Single-task, cooperative: every `poll_interval_s` the scheduler runs a
//! cycle of radar sweep → ingest detections → drain pending → drain
//! fetched → bounded retry processing. Detections are worked in ascending
//! internal-id order, which also makes a thread anchor come before its
//! replies when both land in the same cycle. Shutdown signals are
//! observed between work items; in-flight remote writes complete first.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::calendar::parse_invite;
use crate::config::Config;
use crate::mail::fetcher::{FetchOutcome, MailSource};
use crate::mail::parser::EmailParser;
use crate::mail::radar::{Radar, RadarError};
use crate::notion::calendar::CalendarProjector;
use crate::notion::client::NotionApi;
use crate::notion::projector::Projector;
use crate::state::{StateStore, StoreError, SyncStatus};

/// Retry attempts processed per cycle, to keep retries from starving
/// fresh mail.
const RETRIES_PER_CYCLE: u32 = 3;
/// Consecutive remote auth failures (across cycles) before giving up.
const AUTH_FAILURE_LIMIT: u32 = 5;

/// Why the loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean shutdown on signal (exit code 0).
    Shutdown,
    /// Persistent remote authentication failure (exit code 3).
    AuthFailure,
}

#[derive(Error, Debug)]
enum CycleError {
    #[error(transparent)]
    Radar(#[from] RadarError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Running counters, reported at shutdown.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub detected: u64,
    pub synced: u64,
    pub skipped: u64,
    pub vanished: u64,
    pub invites: u64,
    pub failures: u64,
}

/// Drives the four pipeline stages against one state store.
pub struct Scheduler {
    config: Arc<Config>,
    store: StateStore,
    radar: Radar,
    mail: Arc<dyn MailSource>,
    parser: EmailParser,
    projector: Projector,
    calendar: Option<CalendarProjector>,
    shutdown: watch::Receiver<bool>,
    consecutive_auth_failures: u32,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        store: StateStore,
        radar: Radar,
        mail: Arc<dyn MailSource>,
        notion: Arc<dyn NotionApi>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let scratch_root = std::env::temp_dir().join("despacho");
        let parser = EmailParser::new(
            scratch_root,
            config.max_attachment_bytes,
            config.allowed_attachment_exts.clone(),
        );
        let projector = Projector::new(
            Arc::clone(&notion),
            Arc::clone(&mail),
            store.clone(),
            parser.clone(),
            config.email_database_id.clone(),
            config.user_email.clone(),
        );
        let calendar = config
            .calendar_database_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .map(|id| CalendarProjector::new(Arc::clone(&notion), id));

        Self {
            config,
            store,
            radar,
            mail,
            parser,
            projector,
            calendar,
            shutdown,
            consecutive_auth_failures: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Run until a shutdown signal or a persistent auth failure.
    pub async fn run(&mut self) -> ExitReason {
        info!(
            poll_interval_s = self.config.poll_interval_s,
            mailboxes = ?self.config.sync_mailboxes,
            "scheduler started"
        );

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => {}
            }
            if self.stopping() {
                info!(stats = ?self.stats, "scheduler stopped");
                return ExitReason::Shutdown;
            }

            self.run_once().await;

            if self.consecutive_auth_failures >= AUTH_FAILURE_LIMIT {
                error!(
                    failures = self.consecutive_auth_failures,
                    "remote authentication keeps failing, giving up"
                );
                return ExitReason::AuthFailure;
            }
        }
    }

    /// One full cycle. Public so one-shot invocations and tests can drive
    /// the pipeline without the timer.
    pub async fn run_once(&mut self) {
        self.stats.cycles += 1;

        // Radar or store trouble defers the whole cycle; nothing is
        // mutated by a failed sweep.
        if let Err(e) = self.sweep().await {
            warn!(error = %e, "sweep failed, deferring cycle");
            return;
        }

        self.drain(SyncStatus::Pending).await;
        self.drain(SyncStatus::Fetched).await;
        self.process_retries().await;
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stage 1: change detection and durable ingestion.
    async fn sweep(&mut self) -> Result<(), CycleError> {
        let last_max = self.store.get_last_max_row_id().await?;
        // A cold store ingests history in bounded batches.
        let limit = (last_max == 0).then_some(self.config.init_batch_size);

        let sweep = self.radar.new_rows_since(last_max, limit).await?;
        for row in &sweep.rows {
            if self.store.upsert_on_detect(row).await? {
                self.stats.detected += 1;
            }
        }
        if sweep.max_row_id > last_max {
            self.store.set_last_max_row_id(sweep.max_row_id).await?;
            debug!(from = last_max, to = sweep.max_row_id, "checkpoint advanced");
        }
        Ok(())
    }

    async fn drain(&mut self, status: SyncStatus) {
        let listing = match status {
            SyncStatus::Pending => self.store.pending().await,
            _ => self.store.fetched_pending().await,
        };
        let records = match listing {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "could not list work set");
                return;
            }
        };
        for record in records {
            if self.stopping() {
                return;
            }
            self.process_record(record.internal_id, &record.mailbox).await;
        }
    }

    async fn process_retries(&mut self) {
        let ready = match self.store.ready_for_retry(RETRIES_PER_CYCLE).await {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "could not list retry set");
                return;
            }
        };
        for record in ready {
            if self.stopping() {
                return;
            }
            debug!(
                internal_id = record.internal_id,
                retry = record.retry_count + 1,
                "retrying record"
            );
            self.process_record(record.internal_id, &record.mailbox).await;
        }
    }

    /// Fetch → parse → (dedupe, horizon, calendar) → project one record.
    /// Every failure lands as a state transition, never a propagated
    /// error.
    async fn process_record(&mut self, internal_id: i64, mailbox: &str) {
        let max_retries = self.config.max_retries;

        let fetched = match self.mail.fetch_by_id(internal_id, mailbox).await {
            Ok(FetchOutcome::Fetched(fetched)) => fetched,
            Ok(FetchOutcome::Vanished) => {
                info!(internal_id, "message vanished from mail store, dropping record");
                self.stats.vanished += 1;
                if let Err(e) = self.store.delete(internal_id).await {
                    error!(internal_id, error = %e, "could not delete vanished record");
                }
                return;
            }
            Err(e) => {
                self.stats.failures += 1;
                if let Err(se) = self
                    .store
                    .mark_fetch_failed(internal_id, &e.to_string(), max_retries)
                    .await
                {
                    error!(internal_id, error = %se, "could not record fetch failure");
                }
                return;
            }
        };

        let parsed = match self
            .parser
            .parse(&fetched.source, Some(&fetched.summary.message_id))
        {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.failures += 1;
                if let Err(se) = self
                    .store
                    .mark_failed(internal_id, &format!("parse: {}", e), max_retries)
                    .await
                {
                    error!(internal_id, error = %se, "could not record parse failure");
                }
                return;
            }
        };

        let mut summary = fetched.summary.clone();
        summary.thread_id = parsed.thread_anchor.clone();

        // The fetch may reveal a Message-ID already tracked under another
        // internal id (same message visible through two mailboxes, or the
        // store re-keyed it). Keep the synced record; otherwise the fresh
        // internal id wins.
        match self.store.find_by_message_id(&summary.message_id).await {
            Ok(Some(other)) if other.internal_id != internal_id => {
                if other.sync_status == SyncStatus::Synced {
                    debug!(
                        internal_id,
                        duplicate_of = other.internal_id,
                        message_id = %summary.message_id,
                        "duplicate of a synced record, dropping"
                    );
                    if let Err(e) = self.store.delete(internal_id).await {
                        error!(internal_id, error = %e, "could not delete duplicate record");
                    }
                    return;
                }
                debug!(
                    internal_id,
                    superseded = other.internal_id,
                    "duplicate record superseded by fresh fetch"
                );
                if let Err(e) = self.store.delete(other.internal_id).await {
                    error!(internal_id = other.internal_id, error = %e, "could not delete stale duplicate");
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(internal_id, error = %e, "duplicate lookup failed");
                return;
            }
        }

        if let Err(e) = self
            .store
            .update_after_fetch(internal_id, &summary, parsed.has_attachments())
            .await
        {
            error!(internal_id, error = %e, "could not persist fetch result");
            return;
        }

        // Horizon gate: old mail is tracked but never projected.
        if let Some(horizon) = self.config.sync_horizon() {
            if summary.date < horizon {
                debug!(internal_id, date = %summary.date, "before sync horizon, skipping");
                self.stats.skipped += 1;
                if let Err(e) = self
                    .store
                    .mark_skipped(internal_id, "received before sync horizon")
                    .await
                {
                    error!(internal_id, error = %e, "could not mark record skipped");
                }
                return;
            }
        }

        // A reply whose anchor is itself a not-yet-synced local record is
        // deferred so the anchor's page exists before the reply links to
        // it. The record stays `fetched` and is retried next cycle.
        if let Some(anchor) = summary.thread_id.as_deref() {
            if anchor != summary.message_id {
                match self.store.find_by_message_id(anchor).await {
                    Ok(Some(anchor_record))
                        if anchor_record.sync_status != SyncStatus::Synced
                            && anchor_record.internal_id != internal_id =>
                    {
                        debug!(
                            internal_id,
                            anchor_internal_id = anchor_record.internal_id,
                            "anchor not yet synced, deferring reply"
                        );
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(internal_id, error = %e, "anchor lookup failed");
                        return;
                    }
                }
            }
        }

        // Calendar projection is independent of the email outcome.
        if let (Some(calendar), Some(payload)) = (&self.calendar, &parsed.calendar_part) {
            match parse_invite(payload) {
                Ok(invite) => match calendar.project_invite(&invite).await {
                    Ok(outcome) => {
                        self.stats.invites += 1;
                        debug!(internal_id, page_id = %outcome.page_id(), "invite projected");
                    }
                    Err(e) => {
                        warn!(internal_id, error = %e, "calendar projection failed, continuing");
                    }
                },
                Err(e) => {
                    debug!(internal_id, error = %e, "calendar part did not parse as an invite");
                }
            }
        }

        let record = match self.store.get(internal_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(internal_id, "record disappeared mid-cycle");
                return;
            }
            Err(e) => {
                error!(internal_id, error = %e, "could not reload record");
                return;
            }
        };

        match self
            .projector
            .project_email(&record, &parsed, &fetched.source)
            .await
        {
            Ok(page_id) => {
                self.consecutive_auth_failures = 0;
                self.stats.synced += 1;
                if let Err(e) = self.store.mark_synced(internal_id, &page_id).await {
                    error!(internal_id, error = %e, "could not mark record synced");
                }
            }
            Err(e) if e.is_auth() => {
                // Not retried in-request and not a record failure: the
                // record stays `fetched` and the cycle moves on. The
                // process exits 3 once this keeps happening.
                self.consecutive_auth_failures += 1;
                error!(
                    internal_id,
                    consecutive = self.consecutive_auth_failures,
                    error = %e,
                    "remote authentication failed"
                );
            }
            Err(e) => {
                self.stats.failures += 1;
                if let Err(se) = self
                    .store
                    .mark_failed(internal_id, &e.to_string(), max_retries)
                    .await
                {
                    error!(internal_id, error = %se, "could not record projection failure");
                }
            }
        }
    }
}
