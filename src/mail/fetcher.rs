//! Content acquisition through the mail application's scripting channel.
//!
//! Each fetch is a short-lived `osascript` subprocess addressing one
//! message. Steady-state lookups go by the integer internal identifier
//! (`whose id is N`); the string `Message-ID` form exists only for the
//! rare thread-anchor lookup, because that form is a linear scan inside
//! the mail application and takes minutes on large stores.
//!
//! The host application is known to become unresponsive under concurrent
//! scripting load, so all invocations are serialized behind one lock.
//! Every call is bounded by a wall-clock timeout.
//!
//! Response wire format, produced by the generated script: fields joined
//! by `|||` inside an `OK`/`ERR` envelope, the raw RFC 5322 source last
//! and base64-transported since it may contain any byte.
//!
//! `OK|||<message-id>|||<subject>|||<sender>|||<date>|||<to>|||<cc>|||<read>|||<flagged>|||<base64 source>`
//! `ERR|||NOT_FOUND` — the message no longer exists (vanished)
//! `ERR|||<reason>`  — any other script-side failure

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{NaiveDateTime, TimeZone, Utc};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::state::HeaderSummary;

const FIELD_SEPARATOR: &str = "|||";
const VANISHED_MARKER: &str = "NOT_FOUND";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("script timed out after {0}s")]
    Timeout(u64),

    #[error("script execution failed: {0}")]
    Script(String),

    #[error("malformed script response: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid source transport encoding: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// A successfully fetched message: the authoritative header summary plus
/// the full RFC 5322 source.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub summary: HeaderSummary,
    pub source: Vec<u8>,
}

/// Outcome of a fetch attempt that reached the mail application.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(Box<FetchedMessage>),
    /// The scripting channel reports the message no longer exists.
    Vanished,
}

/// Read access to full message content. The production implementation
/// drives the mail application; tests substitute their own.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Fetch by integer internal identifier — the only acceptable path in
    /// steady-state operation.
    async fn fetch_by_id(&self, internal_id: i64, mailbox: &str)
        -> Result<FetchOutcome, FetchError>;

    /// Fetch by RFC 5322 Message-ID. Linear scan inside the mail
    /// application; reserved for one-off thread-anchor resolution.
    async fn fetch_by_message_id(
        &self,
        message_id: &str,
        mailbox: &str,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Production fetcher invoking `osascript` per call.
pub struct ScriptFetcher {
    account_name: String,
    timeout_secs: u64,
    /// Serializes scripting-channel access; at most one outstanding call.
    lock: Mutex<()>,
}

impl ScriptFetcher {
    pub fn new(account_name: String, timeout_secs: u64) -> Self {
        Self {
            account_name,
            timeout_secs,
            lock: Mutex::new(()),
        }
    }

    async fn run_script(&self, script: String) -> Result<FetchOutcome, FetchError> {
        let _guard = self.lock.lock().await;

        let child = Command::new("osascript")
            .arg("-e")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match timeout(Duration::from_secs(self.timeout_secs), child.wait_with_output())
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                error!(timeout_s = self.timeout_secs, "scripting call timed out");
                return Err(FetchError::Timeout(self.timeout_secs));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Script(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_response(&stdout)
    }

    fn fetch_by_id_script(&self, internal_id: i64, mailbox: &str) -> String {
        let account = escape_applescript(&self.account_name);
        let mailbox = escape_applescript(mailbox);
        format!(
            r#"
tell application "Mail"
    try
        tell account "{account}"
            tell mailbox "{mailbox}"
                set theMessage to first message whose id is {internal_id}
            end tell
        end tell
        {COMMON_BODY}
    on error errMsg number errNum
        if errNum is -1719 then
            return "ERR|||NOT_FOUND"
        end if
        return "ERR|||" & errMsg
    end try
end tell
"#,
        )
    }

    fn fetch_by_message_id_script(&self, message_id: &str, mailbox: &str) -> String {
        let account = escape_applescript(&self.account_name);
        let mailbox = escape_applescript(mailbox);
        let message_id = escape_applescript(message_id);
        format!(
            r#"
tell application "Mail"
    try
        tell account "{account}"
            tell mailbox "{mailbox}"
                set theMessage to first message whose message id is "{message_id}"
            end tell
        end tell
        {COMMON_BODY}
    on error errMsg number errNum
        if errNum is -1719 then
            return "ERR|||NOT_FOUND"
        end if
        return "ERR|||" & errMsg
    end try
end tell
"#,
        )
    }
}

/// Shared script tail: serializes the selected message into the wire
/// envelope. The source goes through `base64` so the delimiter can never
/// collide with message bytes.
const COMMON_BODY: &str = r#"set msgId to message id of theMessage
        set msgSubject to subject of theMessage
        set msgSender to sender of theMessage
        set msgDate to date received of theMessage
        set msgRead to read status of theMessage
        set msgFlagged to flagged status of theMessage
        set msgSource to source of theMessage
        set toList to ""
        repeat with r in to recipients of theMessage
            if toList is not "" then set toList to toList & ", "
            set toList to toList & (address of r)
        end repeat
        set ccList to ""
        repeat with r in cc recipients of theMessage
            if ccList is not "" then set ccList to ccList & ", "
            set ccList to ccList & (address of r)
        end repeat
        set dateStr to (year of msgDate as string) & "-"
        set monthNum to (month of msgDate as integer)
        if monthNum < 10 then set dateStr to dateStr & "0"
        set dateStr to dateStr & (monthNum as string) & "-"
        set dayNum to (day of msgDate as integer)
        if dayNum < 10 then set dateStr to dateStr & "0"
        set dateStr to dateStr & (dayNum as string) & "T"
        set hourNum to (hours of msgDate as integer)
        if hourNum < 10 then set dateStr to dateStr & "0"
        set dateStr to dateStr & (hourNum as string) & ":"
        set minuteNum to (minutes of msgDate as integer)
        if minuteNum < 10 then set dateStr to dateStr & "0"
        set dateStr to dateStr & (minuteNum as string) & ":"
        set secondNum to (seconds of msgDate as integer)
        if secondNum < 10 then set dateStr to dateStr & "0"
        set dateStr to dateStr & (secondNum as string)
        set encSource to do shell script "printf %s " & quoted form of msgSource & " | /usr/bin/base64"
        return "OK|||" & msgId & "|||" & msgSubject & "|||" & msgSender & "|||" & dateStr & "|||" & toList & "|||" & ccList & "|||" & (msgRead as string) & "|||" & (msgFlagged as string) & "|||" & encSource"#;

#[async_trait]
impl MailSource for ScriptFetcher {
    async fn fetch_by_id(
        &self,
        internal_id: i64,
        mailbox: &str,
    ) -> Result<FetchOutcome, FetchError> {
        debug!(internal_id, mailbox, "fetching message by internal id");
        self.run_script(self.fetch_by_id_script(internal_id, mailbox))
            .await
    }

    async fn fetch_by_message_id(
        &self,
        message_id: &str,
        mailbox: &str,
    ) -> Result<FetchOutcome, FetchError> {
        warn!(message_id, mailbox, "fetching message by string id (slow path)");
        self.run_script(self.fetch_by_message_id_script(message_id, mailbox))
            .await
    }
}

/// Parse the script's wire envelope into a fetch outcome.
pub fn parse_response(raw: &str) -> Result<FetchOutcome, FetchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FetchError::Malformed("empty response".to_string()));
    }

    if let Some(err) = raw.strip_prefix(&format!("ERR{}", FIELD_SEPARATOR)) {
        if err.trim() == VANISHED_MARKER {
            return Ok(FetchOutcome::Vanished);
        }
        return Err(FetchError::Script(err.trim().to_string()));
    }

    let Some(body) = raw.strip_prefix(&format!("OK{}", FIELD_SEPARATOR)) else {
        return Err(FetchError::Malformed(format!(
            "unexpected envelope: {}",
            &raw[..raw.len().min(80)]
        )));
    };

    let fields: Vec<&str> = body.splitn(9, FIELD_SEPARATOR).collect();
    if fields.len() != 9 {
        return Err(FetchError::Malformed(format!(
            "expected 9 fields, got {}",
            fields.len()
        )));
    }

    let (sender_display, sender_address) = split_sender(fields[2]);
    let date = parse_script_date(fields[3]);
    let source_b64: String = fields[8]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let source = BASE64_STANDARD.decode(source_b64)?;

    let summary = HeaderSummary {
        message_id: fields[0].trim().trim_matches(['<', '>']).to_string(),
        thread_id: None, // filled from the parsed source by the caller
        subject: fields[1].trim().to_string(),
        sender_address,
        sender_display,
        to_list: fields[4].trim().to_string(),
        cc_list: fields[5].trim().to_string(),
        date,
        is_read: fields[6].trim().eq_ignore_ascii_case("true"),
        is_flagged: fields[7].trim().eq_ignore_ascii_case("true"),
    };

    Ok(FetchOutcome::Fetched(Box::new(FetchedMessage {
        summary,
        source,
    })))
}

/// Split `"Name <addr@host>"` into display name and bare address.
fn split_sender(sender: &str) -> (Option<String>, String) {
    let sender = sender.trim();
    if let (Some(start), Some(end)) = (sender.find('<'), sender.rfind('>')) {
        if start < end {
            let display = sender[..start].trim().trim_matches('"').trim();
            let address = sender[start + 1..end].trim().to_string();
            let display = (!display.is_empty()).then(|| display.to_string());
            return (display, address);
        }
    }
    (None, sender.to_string())
}

/// The script formats the receipt date as a naive local-time ISO stamp.
fn parse_script_date(value: &str) -> chrono::DateTime<Utc> {
    match NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%dT%H:%M:%S") {
        Ok(naive) => chrono::Local
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
        Err(_) => {
            warn!(value, "unparseable script date, substituting now");
            Utc::now()
        }
    }
}

/// Escape text embedded in a generated script string literal.
fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\n', '\r', '\t'], " ")
}
