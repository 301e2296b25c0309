//! Mailbox URL decoding.
//!
//! The mail store's index records each mailbox as a URL whose path
//! segments are percent-encoded (`imap://user@host/INBOX`,
//! `.../E6%94%B6%E4%BB%B6%E7%AE%B1`). The human-meaningful name is the
//! decoded last segment. Decoded names pass through verbatim: the
//! scripting channel expects the user's locale-dependent mailbox label,
//! so no canonicalization happens here.

use percent_encoding::percent_decode_str;

/// Extract the mailbox name from an index mailbox URL. Returns `None`
/// for empty or unparseable URLs.
pub fn name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let rest = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let segment = rest.rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    let name = decoded.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
