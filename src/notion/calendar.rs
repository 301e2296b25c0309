//! Calendar page projection.
//!
//! One page per event uid in the calendar database. Re-observing a uid
//! (a rescheduled or updated invitation) updates the existing page in
//! place, so a meeting never duplicates no matter how many invitation
//! messages carry it. Outcomes here never affect the email projection.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::calendar::Invite;
use crate::notion::blocks;
use crate::notion::client::{NotionApi, NotionError};

/// Property carrying the event uid (indexed).
const PROP_EVENT_ID: &str = "Event ID";

/// What happened to the calendar page.
#[derive(Debug, PartialEq, Eq)]
pub enum CalendarOutcome {
    Created(String),
    Updated(String),
}

impl CalendarOutcome {
    pub fn page_id(&self) -> &str {
        match self {
            CalendarOutcome::Created(id) | CalendarOutcome::Updated(id) => id,
        }
    }
}

/// Projects decoded invitations into the calendar database.
pub struct CalendarProjector {
    notion: Arc<dyn NotionApi>,
    database_id: String,
}

impl CalendarProjector {
    pub fn new(notion: Arc<dyn NotionApi>, database_id: String) -> Self {
        Self {
            notion,
            database_id,
        }
    }

    /// Create or update the page for this invitation's uid.
    pub async fn project_invite(&self, invite: &Invite) -> Result<CalendarOutcome, NotionError> {
        let properties = build_properties(invite);

        match self
            .notion
            .find_page_by_text(&self.database_id, PROP_EVENT_ID, &invite.event_uid)
            .await?
        {
            Some(page_id) => {
                self.notion.update_page(&page_id, properties).await?;
                debug!(uid = %invite.event_uid, page_id = %page_id, "calendar page updated");
                Ok(CalendarOutcome::Updated(page_id))
            }
            None => {
                let children = description_children(invite);
                let page_id = self
                    .notion
                    .create_page(&self.database_id, properties, children)
                    .await?;
                info!(uid = %invite.event_uid, page_id = %page_id, title = %invite.title, "calendar page created");
                Ok(CalendarOutcome::Created(page_id))
            }
        }
    }
}

fn build_properties(invite: &Invite) -> Value {
    let status = if invite.cancelled {
        "Cancelled"
    } else {
        "Tentative"
    };

    let mut properties = json!({
        "Title": {
            "title": [{ "text": { "content": blocks::truncate_utf16(&invite.title, blocks::MAX_TEXT_UNITS) } }]
        },
        PROP_EVENT_ID: { "rich_text": blocks::rich_text(&invite.event_uid) },
        "Date": {
            "date": {
                "start": invite.start.to_rfc3339(),
                "end": invite.end.to_rfc3339(),
            }
        },
        "All Day": { "checkbox": invite.all_day },
        "Status": { "select": { "name": status } },
    });

    if let Some(organizer) = organizer_label(invite) {
        properties["Organizer"] = json!({ "rich_text": blocks::rich_text(&organizer) });
    }
    if let Some(location) = &invite.location {
        properties["Location"] = json!({ "rich_text": blocks::rich_text(location) });
    }
    if let Some(url) = &invite.join_url {
        properties["Join URL"] = json!({ "url": url });
    }

    properties
}

fn organizer_label(invite: &Invite) -> Option<String> {
    match (&invite.organizer, &invite.organizer_email) {
        (Some(name), Some(email)) => Some(format!("{} <{}>", name, email)),
        (Some(name), None) => Some(name.clone()),
        (None, Some(email)) => Some(email.clone()),
        (None, None) => None,
    }
}

fn description_children(invite: &Invite) -> Vec<Value> {
    match &invite.description {
        Some(description) if !description.trim().is_empty() => {
            blocks::text_to_blocks(description)
        }
        _ => Vec::new(),
    }
}
