//! Embedded calendar invitation parsing.
//!
//! Decodes the `text/calendar` payload of a message into the fields the
//! calendar projection needs. Handles RFC 5545 line folding, parameterized
//! property keys (`DTSTART;TZID=...`), escaped text values, and the usual
//! datetime shapes (UTC `...Z`, floating local, date-only for all-day
//! events). A conferencing join link is recovered by feature-based
//! scanning of the description and location, accepting the common Teams,
//! Zoom, Meet and Webex URL shapes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InviteError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid datetime value: {0}")]
    InvalidDate(String),
}

/// iCalendar METHOD of the enclosing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteMethod {
    Request,
    Reply,
    Cancel,
    Other,
}

impl InviteMethod {
    fn from_ical(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "REQUEST" => InviteMethod::Request,
            "REPLY" => InviteMethod::Reply,
            "CANCEL" => InviteMethod::Cancel,
            _ => InviteMethod::Other,
        }
    }
}

/// One decoded event invitation.
#[derive(Debug, Clone)]
pub struct Invite {
    /// Unique event id; the natural key for calendar-page coalescing.
    pub event_uid: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub organizer: Option<String>,
    pub organizer_email: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub join_url: Option<String>,
    pub method: InviteMethod,
    pub sequence: u32,
    pub cancelled: bool,
}

static JOIN_URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"https://teams\.microsoft\.com/l/meetup-join/[^\s<>"'\\]+"#,
        r#"https://teams\.microsoft\.com/meet/\d+\?p=[A-Za-z0-9]+"#,
        r#"https://[A-Za-z0-9.-]*zoom\.us/j/[^\s<>"'\\]+"#,
        r#"https://meet\.google\.com/[a-z0-9-]+"#,
        r#"https://[A-Za-z0-9.-]*webex\.com/(?:meet|join)/[^\s<>"'\\]+"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid join-url pattern"))
    .collect()
});

/// Parse a `text/calendar` payload into an [`Invite`].
pub fn parse_invite(ical: &str) -> Result<Invite, InviteError> {
    // RFC 5545 folding: a line starting with space or tab continues the
    // previous line.
    let unfolded = ical.replace("\r\n ", "").replace("\r\n\t", "");
    let unfolded = unfolded.replace("\n ", "").replace("\n\t", "");

    let mut properties: HashMap<String, PropertyValue> = HashMap::new();
    let mut method = InviteMethod::Other;
    let mut in_event = false;

    for raw_line in unfolded.lines() {
        let line = raw_line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "BEGIN:VEVENT" => {
                in_event = true;
                continue;
            }
            "END:VEVENT" => {
                in_event = false;
                continue;
            }
            _ => {}
        }

        let Some((key_part, value)) = line.split_once(':') else {
            continue;
        };

        if !in_event {
            if key_part == "METHOD" {
                method = InviteMethod::from_ical(value);
            }
            continue;
        }

        let mut params = key_part.split(';');
        let key = params.next().unwrap_or(key_part).to_uppercase();
        let params: Vec<String> = params.map(|p| p.to_string()).collect();

        // Only the first VEVENT matters; recurrence exceptions re-state
        // the same UID with RECURRENCE-ID and would overwrite it.
        properties.entry(key).or_insert_with(|| PropertyValue {
            value: value.to_string(),
            params,
        });
    }

    let uid = properties
        .get("UID")
        .map(|p| p.value.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(InviteError::MissingField("UID"))?;

    let title = properties
        .get("SUMMARY")
        .map(|p| decode_text(&p.value))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "(No Title)".to_string());

    let dtstart = properties
        .get("DTSTART")
        .ok_or(InviteError::MissingField("DTSTART"))?;
    let all_day = is_all_day(dtstart);
    let start = parse_datetime(dtstart)?;
    let end = match properties.get("DTEND") {
        Some(dtend) => parse_datetime(dtend)?,
        None => start + chrono::Duration::hours(1),
    };

    let description = properties
        .get("DESCRIPTION")
        .map(|p| decode_text(&p.value))
        .filter(|v| !v.is_empty());
    let location = properties
        .get("LOCATION")
        .map(|p| decode_text(&p.value))
        .filter(|v| !v.is_empty());

    let (organizer, organizer_email) = properties
        .get("ORGANIZER")
        .map(|p| parse_organizer(&p.raw()))
        .unwrap_or((None, None));

    let sequence = properties
        .get("SEQUENCE")
        .and_then(|p| p.value.trim().parse().ok())
        .unwrap_or(0);

    let status_cancelled = properties
        .get("STATUS")
        .map(|p| p.value.trim().eq_ignore_ascii_case("CANCELLED"))
        .unwrap_or(false);
    let cancelled = status_cancelled || method == InviteMethod::Cancel;

    let join_url = description
        .as_deref()
        .and_then(scan_join_url)
        .or_else(|| location.as_deref().and_then(scan_join_url));

    Ok(Invite {
        event_uid: uid,
        title,
        start,
        end,
        all_day,
        organizer,
        organizer_email,
        location,
        description,
        join_url,
        method,
        sequence,
        cancelled,
    })
}

struct PropertyValue {
    value: String,
    params: Vec<String>,
}

impl PropertyValue {
    /// Parameters and value rejoined, for line-shaped sub-parsers.
    fn raw(&self) -> String {
        if self.params.is_empty() {
            self.value.clone()
        } else {
            format!("{}:{}", self.params.join(";"), self.value)
        }
    }
}

fn is_all_day(property: &PropertyValue) -> bool {
    property
        .params
        .iter()
        .any(|p| p.eq_ignore_ascii_case("VALUE=DATE"))
        || property.value.trim().len() == 8
}

fn parse_datetime(property: &PropertyValue) -> Result<DateTime<Utc>, InviteError> {
    let value = property.value.trim();

    if value.len() == 8 {
        // Date-only, all-day shape: YYYYMMDD.
        let date = NaiveDate::parse_from_str(value, "%Y%m%d")
            .map_err(|_| InviteError::InvalidDate(value.to_string()))?;
        return Ok(date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc());
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S")
            .map_err(|_| InviteError::InvalidDate(value.to_string()))?;
        return Ok(naive.and_utc());
    }

    // Floating or TZID-qualified local time. Timezone tables are out of
    // scope here; the stamp is taken as-is.
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .map_err(|_| InviteError::InvalidDate(value.to_string()))?;
    Ok(naive.and_utc())
}

/// `CN=Jane Doe:MAILTO:jane@example.com` → (name, email).
fn parse_organizer(raw: &str) -> (Option<String>, Option<String>) {
    static CN: Lazy<Regex> = Lazy::new(|| Regex::new(r"CN=([^:;]+)").expect("valid CN pattern"));
    static MAILTO: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)MAILTO:([^\s;]+)").expect("valid MAILTO pattern"));

    let name = CN
        .captures(raw)
        .map(|c| c[1].trim().trim_matches(['"', '\'']).to_string())
        .filter(|n| !n.is_empty());
    let email = MAILTO.captures(raw).map(|c| c[1].trim().to_string());
    (name, email)
}

/// Decode iCalendar text escapes.
fn decode_text(value: &str) -> String {
    value
        .replace("\\n", "\n")
        .replace("\\N", "\n")
        .replace("\\,", ",")
        .replace("\\;", ";")
        .replace("\\\\", "\\")
        .trim()
        .to_string()
}

/// Find a conferencing URL in free text.
pub fn scan_join_url(text: &str) -> Option<String> {
    for pattern in JOIN_URL_PATTERNS.iter() {
        if let Some(found) = pattern.find(text) {
            return Some(found.as_str().trim_end_matches('>').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_invite() -> String {
        [
            "BEGIN:VCALENDAR",
            "METHOD:REQUEST",
            "BEGIN:VEVENT",
            "UID:u1@example.com",
            "SUMMARY:Weekly planning",
            "DTSTART:20250602T090000Z",
            "DTEND:20250602T100000Z",
            "LOCATION:Room 4",
            "SEQUENCE:2",
            "ORGANIZER;CN=Jane Doe:MAILTO:jane@example.com",
            "DESCRIPTION:Agenda\\n  Join: https://teams.microsoft.com/l/meetup-join/19%3ameeting_x",
            "END:VEVENT",
            "END:VCALENDAR",
        ]
        .join("\r\n")
    }

    #[test]
    fn parses_request_invite() {
        let invite = parse_invite(&request_invite()).unwrap();
        assert_eq!(invite.event_uid, "u1@example.com");
        assert_eq!(invite.title, "Weekly planning");
        assert_eq!(invite.method, InviteMethod::Request);
        assert_eq!(invite.sequence, 2);
        assert!(!invite.all_day);
        assert!(!invite.cancelled);
        assert_eq!(invite.start.to_rfc3339(), "2025-06-02T09:00:00+00:00");
        assert_eq!(invite.end.to_rfc3339(), "2025-06-02T10:00:00+00:00");
        assert_eq!(invite.location.as_deref(), Some("Room 4"));
        assert_eq!(invite.organizer.as_deref(), Some("Jane Doe"));
        assert_eq!(invite.organizer_email.as_deref(), Some("jane@example.com"));
        assert_eq!(
            invite.join_url.as_deref(),
            Some("https://teams.microsoft.com/l/meetup-join/19%3ameeting_x")
        );
    }

    #[test]
    fn unfolds_continuation_lines() {
        let folded = request_invite().replace(
            "SUMMARY:Weekly planning",
            "SUMMARY:Weekly\r\n  planning session",
        );
        let invite = parse_invite(&folded).unwrap();
        assert_eq!(invite.title, "Weekly planning session");
    }

    #[test]
    fn all_day_event_from_date_only_value() {
        let ical = request_invite()
            .replace("DTSTART:20250602T090000Z", "DTSTART;VALUE=DATE:20250602")
            .replace("DTEND:20250602T100000Z", "DTEND;VALUE=DATE:20250603");
        let invite = parse_invite(&ical).unwrap();
        assert!(invite.all_day);
        assert_eq!(invite.start.to_rfc3339(), "2025-06-02T00:00:00+00:00");
    }

    #[test]
    fn missing_dtend_defaults_to_one_hour() {
        let ical = request_invite().replace("DTEND:20250602T100000Z\r\n", "");
        let invite = parse_invite(&ical).unwrap();
        assert_eq!(invite.end - invite.start, chrono::Duration::hours(1));
    }

    #[test]
    fn cancel_method_marks_cancelled() {
        let ical = request_invite().replace("METHOD:REQUEST", "METHOD:CANCEL");
        let invite = parse_invite(&ical).unwrap();
        assert_eq!(invite.method, InviteMethod::Cancel);
        assert!(invite.cancelled);
    }

    #[test]
    fn missing_uid_is_an_error() {
        let ical = request_invite().replace("UID:u1@example.com\r\n", "");
        assert!(matches!(
            parse_invite(&ical),
            Err(InviteError::MissingField("UID"))
        ));
    }

    #[test]
    fn join_url_shapes() {
        assert_eq!(
            scan_join_url("join https://example.zoom.us/j/123456?pwd=abc now").as_deref(),
            Some("https://example.zoom.us/j/123456?pwd=abc")
        );
        assert_eq!(
            scan_join_url("at https://meet.google.com/abc-defg-hij").as_deref(),
            Some("https://meet.google.com/abc-defg-hij")
        );
        assert_eq!(
            scan_join_url("short form https://teams.microsoft.com/meet/93214?p=Xy12Zz").as_deref(),
            Some("https://teams.microsoft.com/meet/93214?p=Xy12Zz")
        );
        assert_eq!(scan_join_url("no links here"), None);
    }

    #[test]
    fn escaped_text_is_decoded() {
        assert_eq!(decode_text("a\\, b\\; c\\nnext"), "a, b; c\nnext");
    }
}
