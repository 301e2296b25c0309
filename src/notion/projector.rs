//! Email page projection.
//!
//! Creates exactly one remote page per message. The indexed `Message ID`
//! property is queried before any write, so replaying a cycle is free of
//! side effects. Thread linkage is resolved at write time against the
//! same database: the anchor's page is looked up by `Message ID`, a rare
//! scripting-channel lookup projects an anchor the store has never seen
//! (bounded to depth 1), and anchors the mail store no longer has fall
//! back to a single well-known page so orphaned replies stay connected.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::mail::fetcher::{FetchOutcome, MailSource};
use crate::mail::parser::{EmailParser, ParseError, ParsedEmail};
use crate::notion::blocks;
use crate::notion::client::{NotionApi, NotionError};
use crate::state::{MessageRecord, StateStore, StoreError};

/// Title of the page that adopts replies whose thread anchor cannot be
/// resolved from the mail store.
pub const FALLBACK_ANCHOR_TITLE: &str = "Unresolved Threads";
/// Well-known `Message ID` of the fallback anchor page.
pub const FALLBACK_ANCHOR_MESSAGE_ID: &str = "unresolved-thread-anchor@despacho.local";

/// Property name carrying the RFC 5322 Message-ID (indexed).
const PROP_MESSAGE_ID: &str = "Message ID";

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("remote error: {0}")]
    Notion(#[from] NotionError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("anchor parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("record {0} has no message id")]
    MissingMessageId(i64),
}

impl ProjectError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProjectError::Notion(e) if e.is_auth())
    }
}

/// Header-level inputs for one page, independent of whether they come
/// from a store record or from an ad-hoc anchor fetch.
struct PageSeed {
    message_id: String,
    thread_id: Option<String>,
    subject: String,
    sender_address: String,
    sender_display: Option<String>,
    to_list: String,
    cc_list: String,
    date: chrono::DateTime<chrono::Utc>,
    mailbox: String,
    is_read: bool,
    is_flagged: bool,
}

impl PageSeed {
    fn from_record(record: &MessageRecord) -> Result<Self, ProjectError> {
        let message_id = record
            .message_id
            .clone()
            .ok_or(ProjectError::MissingMessageId(record.internal_id))?;
        Ok(Self {
            message_id,
            thread_id: record.thread_id.clone(),
            subject: record.subject.clone(),
            sender_address: record.sender_address.clone(),
            sender_display: record.sender_display.clone(),
            to_list: record.to_list.clone(),
            cc_list: record.cc_list.clone(),
            date: record.date_received,
            mailbox: record.mailbox.clone(),
            is_read: record.is_read,
            is_flagged: record.is_flagged,
        })
    }
}

/// Idempotent projector for email pages.
pub struct Projector {
    notion: Arc<dyn NotionApi>,
    mail: Arc<dyn MailSource>,
    store: StateStore,
    parser: EmailParser,
    email_database_id: String,
    user_email: String,
    /// Cached id of the fallback anchor page.
    fallback_anchor: Mutex<Option<String>>,
}

impl Projector {
    pub fn new(
        notion: Arc<dyn NotionApi>,
        mail: Arc<dyn MailSource>,
        store: StateStore,
        parser: EmailParser,
        email_database_id: String,
        user_email: String,
    ) -> Self {
        Self {
            notion,
            mail,
            store,
            parser,
            email_database_id,
            user_email,
            fallback_anchor: Mutex::new(None),
        }
    }

    /// Project one fetched message; returns the remote page id. Safe to
    /// call again for an already-projected message.
    pub async fn project_email(
        &self,
        record: &MessageRecord,
        parsed: &ParsedEmail,
        source: &[u8],
    ) -> Result<String, ProjectError> {
        let seed = PageSeed::from_record(record)?;
        self.project_page(seed, parsed, source, true).await
    }

    /// Boxed because anchor resolution can recurse back into this
    /// function (bounded to depth 1).
    fn project_page<'a>(
        &'a self,
        seed: PageSeed,
        parsed: &'a ParsedEmail,
        source: &'a [u8],
        resolve_anchor: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProjectError>> + Send + 'a>> {
        Box::pin(async move {
            // Idempotence gate: one page per Message-ID, ever.
            if let Some(existing) = self
                .notion
                .find_page_by_text(&self.email_database_id, PROP_MESSAGE_ID, &seed.message_id)
                .await?
            {
                debug!(message_id = %seed.message_id, page_id = %existing, "page already exists");
                return Ok(existing);
            }

            let parent = if resolve_anchor {
                self.resolve_parent(&seed).await?
            } else {
                None
            };

            // Inline images go up first so the converter can substitute the
            // cid references with real upload handles.
            let referenced = parsed
                .body_html
                .as_deref()
                .map(blocks::cid_references)
                .unwrap_or_default();

            let mut image_map = HashMap::new();
            let mut unreferenced_images = Vec::new();
            for image in &parsed.inline_images {
                match self
                    .notion
                    .upload_file(&image.path, &image.filename)
                    .await
                {
                    Ok(upload_id) => {
                        if referenced.contains(&image.content_id)
                            || referenced
                                .iter()
                                .any(|r| r.split('@').next() == image.content_id.split('@').next())
                        {
                            image_map.insert(image.content_id.clone(), upload_id);
                        } else {
                            unreferenced_images.push((image.filename.clone(), upload_id));
                        }
                    }
                    Err(e) if e.is_auth() => return Err(e.into()),
                    Err(e) => {
                        warn!(filename = %image.filename, error = %e, "inline image upload failed, continuing");
                    }
                }
            }

            let mut attachment_uploads = Vec::new();
            for attachment in &parsed.attachments {
                match self
                    .notion
                    .upload_file(&attachment.path, &upload_filename(&attachment.filename))
                    .await
                {
                    Ok(upload_id) => {
                        attachment_uploads.push((attachment.clone(), upload_id));
                    }
                    Err(e) if e.is_auth() => return Err(e.into()),
                    Err(e) => {
                        warn!(filename = %attachment.filename, error = %e, "attachment upload failed, continuing");
                    }
                }
            }

            let eml_upload = self.upload_original_source(parsed, source).await;

            let properties = self.build_properties(&seed, parsed, parent.as_deref(), eml_upload);
            let children = build_children(parsed, &attachment_uploads, &unreferenced_images, &image_map);

            let (first, rest) = blocks::chunk_children(children);
            let page_id = self
                .notion
                .create_page(&self.email_database_id, properties, first)
                .await?;
            for batch in rest {
                self.notion.append_children(&page_id, batch).await?;
            }

            info!(message_id = %seed.message_id, page_id = %page_id, "email projected");
            Ok(page_id)
        })
    }

    /// Resolve the page that represents this message's thread anchor.
    async fn resolve_parent(&self, seed: &PageSeed) -> Result<Option<String>, ProjectError> {
        let Some(anchor) = seed.thread_id.as_deref() else {
            return Ok(None);
        };
        // Self-anchored messages start their own thread.
        if anchor == seed.message_id {
            return Ok(None);
        }

        // The cheap path: the anchor already has a page.
        if let Some(page) = self
            .notion
            .find_page_by_text(&self.email_database_id, PROP_MESSAGE_ID, anchor)
            .await?
        {
            return Ok(Some(page));
        }

        // Known-dead anchors short-circuit to the fallback page.
        if self.store.is_unresolvable_anchor(anchor).await? {
            return Ok(Some(self.ensure_fallback_anchor().await?));
        }

        // The anchor's internal id is unknown, so this is the one place a
        // string Message-ID lookup is allowed. Depth is bounded: the
        // anchor's own anchor is not resolved further.
        match self.mail.fetch_by_message_id(anchor, &seed.mailbox).await {
            Ok(FetchOutcome::Fetched(fetched)) => {
                let parsed = self
                    .parser
                    .parse(&fetched.source, Some(&fetched.summary.message_id))?;
                let anchor_seed = PageSeed {
                    message_id: fetched.summary.message_id.clone(),
                    thread_id: None,
                    subject: fetched.summary.subject.clone(),
                    sender_address: fetched.summary.sender_address.clone(),
                    sender_display: fetched.summary.sender_display.clone(),
                    to_list: fetched.summary.to_list.clone(),
                    cc_list: fetched.summary.cc_list.clone(),
                    date: fetched.summary.date,
                    mailbox: seed.mailbox.clone(),
                    is_read: fetched.summary.is_read,
                    is_flagged: fetched.summary.is_flagged,
                };
                let page = self
                    .project_page(anchor_seed, &parsed, &fetched.source, false)
                    .await?;
                info!(anchor, page_id = %page, "thread anchor projected on demand");
                Ok(Some(page))
            }
            Ok(FetchOutcome::Vanished) => {
                self.store.remember_unresolvable_anchor(anchor).await?;
                info!(anchor, "thread anchor vanished from mail store, using fallback");
                Ok(Some(self.ensure_fallback_anchor().await?))
            }
            Err(e) => {
                // Transient lookup trouble: attach to the fallback now but
                // leave the negative cache alone so a later thread member
                // can still find the real anchor.
                warn!(anchor, error = %e, "anchor lookup failed, using fallback");
                Ok(Some(self.ensure_fallback_anchor().await?))
            }
        }
    }

    /// Find or lazily create the fallback anchor page.
    async fn ensure_fallback_anchor(&self) -> Result<String, ProjectError> {
        let mut cached = self.fallback_anchor.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let page_id = match self
            .notion
            .find_page_by_text(
                &self.email_database_id,
                PROP_MESSAGE_ID,
                FALLBACK_ANCHOR_MESSAGE_ID,
            )
            .await?
        {
            Some(existing) => existing,
            None => {
                let properties = json!({
                    "Subject": { "title": [{ "text": { "content": FALLBACK_ANCHOR_TITLE } }] },
                    PROP_MESSAGE_ID: { "rich_text": blocks::rich_text(FALLBACK_ANCHOR_MESSAGE_ID) },
                });
                let children = vec![blocks::callout(
                    "Replies land here when the first message of their thread is no longer in the mail store.",
                    "🧵",
                )];
                let id = self
                    .notion
                    .create_page(&self.email_database_id, properties, children)
                    .await?;
                info!(page_id = %id, "fallback anchor page created");
                id
            }
        };

        *cached = Some(page_id.clone());
        Ok(page_id)
    }

    /// Upload the raw RFC 822 source for the `Original EML` property. The
    /// remote store rejects the `.eml` extension, so the file goes up as
    /// `.txt`. Failure here is logged, not fatal.
    async fn upload_original_source(&self, parsed: &ParsedEmail, source: &[u8]) -> Option<String> {
        let path = parsed.scratch_dir.join("original-email.txt");
        if let Err(e) = std::fs::write(&path, source) {
            warn!(error = %e, "could not stage original source file");
            return None;
        }
        match self.notion.upload_file(&path, "original-email.txt").await {
            Ok(upload_id) => Some(upload_id),
            Err(e) => {
                warn!(error = %e, "original source upload failed, page will lack Original EML");
                None
            }
        }
    }

    fn build_properties(
        &self,
        seed: &PageSeed,
        parsed: &ParsedEmail,
        parent: Option<&str>,
        eml_upload: Option<String>,
    ) -> Value {
        let subject = if seed.subject.trim().is_empty() {
            "(No Subject)".to_string()
        } else {
            seed.subject.clone()
        };

        let mut properties = json!({
            "Subject": {
                "title": [{ "text": { "content": blocks::truncate_utf16(&subject, blocks::MAX_TEXT_UNITS) } }]
            },
            PROP_MESSAGE_ID: { "rich_text": blocks::rich_text(&seed.message_id) },
            "From Name": { "rich_text": blocks::rich_text(seed.sender_display.as_deref().unwrap_or("")) },
            "To": { "rich_text": blocks::rich_text(&seed.to_list) },
            "CC": { "rich_text": blocks::rich_text(&seed.cc_list) },
            "Date": { "date": { "start": seed.date.to_rfc3339() } },
            "Mailbox": { "select": { "name": seed.mailbox } },
            "Is Read": { "checkbox": seed.is_read },
            "Is Flagged": { "checkbox": seed.is_flagged },
            "Has Attachments": { "checkbox": parsed.has_attachments() },
            "Owner": { "email": self.user_email },
        });

        if !seed.sender_address.trim().is_empty() {
            properties["From"] = json!({ "email": seed.sender_address });
        }
        if let Some(thread_id) = &seed.thread_id {
            properties["Thread ID"] = json!({ "rich_text": blocks::rich_text(thread_id) });
        }
        if let Some(parent) = parent {
            properties["Parent Item"] = json!({ "relation": [{ "id": parent }] });
        }
        if let Some(upload_id) = eml_upload {
            properties["Original EML"] = json!({
                "files": [{ "type": "file_upload", "file_upload": { "id": upload_id } }]
            });
        }

        properties
    }
}

fn upload_filename(filename: &str) -> String {
    // The remote store refuses .eml uploads; everything else keeps its name.
    match filename.strip_suffix(".eml") {
        Some(stem) => format!("{}.txt", stem),
        None => filename.to_string(),
    }
}

/// Assemble the page body: attachments section on top (the way mail
/// clients render), then the converted message body, then a pointer at
/// the archived source.
fn build_children(
    parsed: &ParsedEmail,
    attachment_uploads: &[(crate::mail::parser::Attachment, String)],
    unreferenced_images: &[(String, String)],
    image_map: &HashMap<String, String>,
) -> Vec<Value> {
    let mut children = Vec::new();

    if !attachment_uploads.is_empty() || !unreferenced_images.is_empty() {
        children.push(blocks::heading(3, "📎 Attachments"));
        for (attachment, upload_id) in attachment_uploads {
            if attachment.media_type.starts_with("image/") {
                children.push(blocks::image_upload(upload_id, &attachment.filename));
            } else {
                children.push(blocks::file_upload(upload_id, &attachment.filename));
            }
        }
        for (filename, upload_id) in unreferenced_images {
            children.push(blocks::image_upload(upload_id, filename));
        }
        children.push(blocks::divider());
    }

    children.push(blocks::heading(2, "📧 Message"));
    match (&parsed.body_html, &parsed.body_text) {
        (Some(html), _) => children.extend(blocks::convert(html, image_map)),
        (None, Some(text)) => children.extend(blocks::text_to_blocks(text)),
        (None, None) => children.push(blocks::paragraph("(empty message body)")),
    }

    children.push(blocks::divider());
    children.push(blocks::callout(
        "The complete original message is archived in the Original EML property.",
        "💾",
    ));

    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn eml_uploads_are_renamed_to_txt() {
        assert_eq!(upload_filename("forwarded.eml"), "forwarded.txt");
        assert_eq!(upload_filename("report.pdf"), "report.pdf");
    }

    #[test]
    fn children_layout_puts_attachments_first() {
        let parsed = ParsedEmail {
            message_id: Some("m@x".to_string()),
            thread_anchor: None,
            subject: Some("s".to_string()),
            sender_address: Some("a@x".to_string()),
            sender_display: None,
            body_html: Some("<p>body</p>".to_string()),
            body_text: None,
            inline_images: Vec::new(),
            attachments: Vec::new(),
            calendar_part: None,
            scratch_dir: std::env::temp_dir(),
        };
        let attachment = crate::mail::parser::Attachment {
            filename: "report.pdf".to_string(),
            media_type: "application/pdf".to_string(),
            size: 10,
            path: PathBuf::from("/tmp/report.pdf"),
        };
        let children = build_children(
            &parsed,
            &[(attachment, "u1".to_string())],
            &[],
            &HashMap::new(),
        );

        assert_eq!(children[0]["type"], "heading_3");
        assert_eq!(children[1]["type"], "file");
        assert_eq!(children[1]["file"]["file_upload"]["id"], "u1");
        assert_eq!(children[2]["type"], "divider");
        assert_eq!(children[3]["type"], "heading_2");
        assert!(children.iter().any(|b| b["type"] == "paragraph"));
        assert_eq!(children.last().unwrap()["type"], "callout");
    }

    #[test]
    fn empty_body_still_renders_a_page() {
        let parsed = ParsedEmail {
            message_id: Some("m@x".to_string()),
            thread_anchor: None,
            subject: None,
            sender_address: None,
            sender_display: None,
            body_html: None,
            body_text: None,
            inline_images: Vec::new(),
            attachments: Vec::new(),
            calendar_part: None,
            scratch_dir: std::env::temp_dir(),
        };
        let children = build_children(&parsed, &[], &[], &HashMap::new());
        assert!(children
            .iter()
            .any(|b| b["paragraph"]["rich_text"][0]["text"]["content"] == "(empty message body)"));
    }
}
