//! RFC 5322 source parsing.
//!
//! Turns a raw message into the in-memory shape the projector needs:
//! thread anchor, preferred body, inline image parts, gated attachments,
//! and the calendar payload when the message carries an invitation.
//! Parsing is pure CPU work and never suspends.
//!
//! Attachment and inline-image bytes are persisted under a per-message
//! scratch directory named by a short content-addressed digest of the
//! `Message-ID`, which keeps path lengths bounded regardless of how long
//! the id is.

use mail_parser::{GetHeader, HeaderName, HeaderValue, Message, MessageParser, MimeHeaders};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unparseable message source")]
    Malformed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An image part carrying a `Content-ID`, persisted to disk.
#[derive(Debug, Clone)]
pub struct InlineImage {
    /// Content id without angle brackets.
    pub content_id: String,
    pub path: PathBuf,
    pub media_type: String,
    pub size: u64,
    pub filename: String,
}

/// A regular file attachment, persisted to disk.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub media_type: String,
    pub size: u64,
    pub path: PathBuf,
}

/// Parsed message content.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    /// Anchor of the reply chain: first `References` entry, else
    /// `In-Reply-To`, else none (the message anchors itself).
    pub thread_anchor: Option<String>,
    pub subject: Option<String>,
    pub sender_address: Option<String>,
    pub sender_display: Option<String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub inline_images: Vec<InlineImage>,
    pub attachments: Vec<Attachment>,
    /// Raw text/calendar payload, when present.
    pub calendar_part: Option<String>,
    /// Scratch directory holding this message's part files.
    pub scratch_dir: PathBuf,
}

impl ParsedEmail {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Source parser with the configured attachment gates.
#[derive(Clone)]
pub struct EmailParser {
    scratch_root: PathBuf,
    max_attachment_bytes: u64,
    allowed_exts: Vec<String>,
}

impl EmailParser {
    pub fn new(scratch_root: PathBuf, max_attachment_bytes: u64, allowed_exts: Vec<String>) -> Self {
        Self {
            scratch_root,
            max_attachment_bytes,
            allowed_exts: allowed_exts.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    /// Parse `source`, persisting binary parts under the scratch root.
    /// `fallback_message_id` covers sources whose own header is missing.
    pub fn parse(
        &self,
        source: &[u8],
        fallback_message_id: Option<&str>,
    ) -> Result<ParsedEmail, ParseError> {
        let message = MessageParser::default()
            .parse(source)
            .ok_or(ParseError::Malformed)?;

        let message_id = message
            .message_id()
            .map(|id| id.to_string())
            .or_else(|| fallback_message_id.map(|id| id.to_string()));
        let thread_anchor = extract_thread_anchor(&message);

        let subject = message.subject().map(|s| s.to_string());
        let (sender_display, sender_address) = extract_sender(&message);

        let body_html = message.body_html(0).map(|b| b.into_owned());
        let body_text = message.body_text(0).map(|b| b.into_owned());

        // cid references the HTML makes; parts without a Content-ID header
        // can still be inline if their filename matches one of these.
        let html_cids: Vec<String> = body_html
            .as_deref()
            .map(html_cid_references)
            .unwrap_or_default();

        let digest_key = message_id.as_deref().unwrap_or("unidentified");
        let scratch_dir = self.scratch_root.join(digest16(digest_key));
        std::fs::create_dir_all(&scratch_dir)?;

        let mut inline_images = Vec::new();
        let mut attachments = Vec::new();
        let mut calendar_part = None;

        for (index, part) in message.attachments().enumerate() {
            let media_type = part_media_type(part);

            if media_type == "text/calendar" {
                if calendar_part.is_none() {
                    calendar_part = part
                        .text_contents()
                        .map(|t| t.to_string())
                        .or_else(|| String::from_utf8(part.contents().to_vec()).ok());
                }
                continue;
            }

            let bytes = part.contents();
            if bytes.is_empty() {
                continue;
            }

            let content_id = part
                .content_id()
                .map(|id| id.trim_matches(['<', '>']).to_string());
            let declared_name = part.attachment_name().map(sanitize_filename);
            let size = bytes.len() as u64;

            if size > self.max_attachment_bytes {
                warn!(
                    filename = declared_name.as_deref().unwrap_or("(unnamed)"),
                    size,
                    limit = self.max_attachment_bytes,
                    "attachment dropped: over size limit"
                );
                continue;
            }

            // Extension-less parts are kept only when their first bytes
            // carry a recognized image signature.
            let sniffed = sniff_image_signature(bytes);
            let media_type = if media_type == "application/octet-stream" {
                sniffed.map(|t| t.to_string()).unwrap_or(media_type)
            } else {
                media_type
            };

            let filename = declared_name.clone().unwrap_or_else(|| {
                let ext = extension_for_media_type(&media_type);
                match &content_id {
                    Some(cid) => sanitize_filename(&format!("{}{}", cid, ext)),
                    None => format!("part-{}{}", index + 1, ext),
                }
            });

            // Some clients embed an image by filename instead of giving the
            // part a Content-ID; a cid: reference matching the declared
            // name marks it inline all the same.
            let content_id = content_id.or_else(|| {
                if media_type.starts_with("image/") {
                    declared_name
                        .as_deref()
                        .and_then(|name| match_cid_by_filename(name, &html_cids))
                } else {
                    None
                }
            });

            if let Some(cid) = content_id {
                let path = scratch_dir.join(&filename);
                std::fs::write(&path, bytes)?;
                inline_images.push(InlineImage {
                    content_id: cid,
                    path,
                    media_type,
                    size,
                    filename,
                });
                continue;
            }

            let has_extension = Path::new(&filename)
                .extension()
                .map(|e| !e.is_empty())
                .unwrap_or(false);
            if has_extension {
                let ext = format!(
                    ".{}",
                    Path::new(&filename)
                        .extension()
                        .unwrap()
                        .to_string_lossy()
                        .to_lowercase()
                );
                if !self.allowed_exts.is_empty() && !self.allowed_exts.contains(&ext) {
                    warn!(filename = %filename, extension = %ext, "attachment dropped: extension not allowed");
                    continue;
                }
            } else if sniffed.is_none() {
                warn!(filename = %filename, "attachment dropped: no extension and not a recognized image");
                continue;
            }

            let path = scratch_dir.join(&filename);
            std::fs::write(&path, bytes)?;
            attachments.push(Attachment {
                filename,
                media_type,
                size,
                path,
            });
        }

        debug!(
            message_id = message_id.as_deref().unwrap_or(""),
            inline = inline_images.len(),
            attachments = attachments.len(),
            has_calendar = calendar_part.is_some(),
            "message parsed"
        );

        Ok(ParsedEmail {
            message_id,
            thread_anchor,
            subject,
            sender_address,
            sender_display,
            body_html,
            body_text,
            inline_images,
            attachments,
            calendar_part,
            scratch_dir,
        })
    }
}

/// First `References` entry, else `In-Reply-To`, both without brackets.
fn extract_thread_anchor(message: &Message) -> Option<String> {
    let from_references = match message.header(HeaderName::References) {
        Some(HeaderValue::TextList(list)) => list.first().map(|s| s.as_ref().to_string()),
        Some(HeaderValue::Text(text)) => text.split_whitespace().next().map(|s| s.to_string()),
        _ => None,
    };
    from_references
        .or_else(|| match message.header(HeaderName::InReplyTo) {
            Some(HeaderValue::Text(text)) => Some(text.as_ref().to_string()),
            Some(HeaderValue::TextList(list)) => list.first().map(|s| s.as_ref().to_string()),
            _ => None,
        })
        .map(|anchor| anchor.trim().trim_matches(['<', '>']).to_string())
        .filter(|anchor| !anchor.is_empty())
}

fn extract_sender(message: &Message) -> (Option<String>, Option<String>) {
    let Some(from) = message.from().and_then(|a| a.first()) else {
        return (None, None);
    };
    (
        from.name.as_ref().map(|n| n.to_string()),
        from.address.as_ref().map(|a| a.to_string()),
    )
}

static CID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"cid:([^"'\s>]+)"#).expect("valid cid pattern"));

/// Content ids referenced from `cid:` URLs in an HTML body.
fn html_cid_references(html: &str) -> Vec<String> {
    CID_PATTERN
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect()
}

/// Match a declared filename against the HTML's cid references. Clients
/// that omit Content-ID reuse the filename inside the cid: URL, with or
/// without the extension or an `@domain` suffix, so containment is
/// checked in both directions.
fn match_cid_by_filename(filename: &str, cids: &[String]) -> Option<String> {
    let filename = filename.trim();
    if filename.is_empty() {
        return None;
    }
    let stem = match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    };
    cids.iter()
        .find(|cid| {
            let bare = cid
                .split('@')
                .next()
                .filter(|b| !b.is_empty())
                .unwrap_or(cid.as_str());
            cid.contains(filename)
                || filename.contains(cid.as_str())
                || filename.contains(bare)
                || cid.contains(stem)
        })
        .cloned()
}

fn part_media_type(part: &mail_parser::MessagePart) -> String {
    match part.content_type() {
        Some(ct) => match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype().to_lowercase(), sub.to_lowercase()),
            None => ct.ctype().to_lowercase(),
        },
        None => "application/octet-stream".to_string(),
    }
}

/// Media type for a recognized image signature in the first bytes.
pub fn sniff_image_signature(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG") {
        Some("image/png")
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else {
        None
    }
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "application/pdf" => ".pdf",
        _ => "",
    }
}

/// First 16 hex characters of the SHA-256 of `key`.
pub fn digest16(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.len() > 120 {
        cleaned.chars().take(120).collect()
    } else {
        cleaned.to_string()
    }
}
