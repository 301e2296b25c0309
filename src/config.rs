//! Service configuration.
//!
//! All options are loaded once at startup from a TOML file and passed by
//! reference to the components that need them. The Notion credential can
//! also come from the `DESPACHO_NOTION_TOKEN` environment variable, which
//! takes precedence over the file so the token does not have to live on
//! disk.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable that overrides `notion_token` from the file.
pub const TOKEN_ENV_VAR: &str = "DESPACHO_NOTION_TOKEN";

/// Configuration errors. All of these are fatal at startup (exit code 2).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required option: {0}")]
    Missing(&'static str),

    #[error("invalid value for {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Notion integration token. May be supplied via `DESPACHO_NOTION_TOKEN`.
    #[serde(default)]
    pub notion_token: String,

    /// Target database for email pages.
    pub email_database_id: String,

    /// Target database for calendar pages. Calendar projection is disabled
    /// when unset.
    #[serde(default)]
    pub calendar_database_id: Option<String>,

    /// Email address of the viewing user, stamped on every page.
    pub user_email: String,

    /// Mail.app account name used by the scripting channel.
    pub mail_account_name: String,

    /// Mailbox names the radar is allowed to emit. Names must match the
    /// user's locale-dependent mailbox labels exactly; they are passed
    /// through to the scripting channel without canonicalization.
    #[serde(default = "default_sync_mailboxes")]
    pub sync_mailboxes: Vec<String>,

    /// Messages received before this date are skipped terminally.
    #[serde(default)]
    pub sync_start_date: Option<NaiveDate>,

    /// Scheduler poll period in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: u64,

    /// Wall-clock limit for a single scripting-channel call.
    #[serde(default = "default_script_timeout")]
    pub script_timeout_s: u64,

    /// Maximum detections ingested per cycle on a cold start.
    #[serde(default = "default_init_batch_size")]
    pub init_batch_size: u32,

    /// Attachments larger than this are dropped (with a log record).
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,

    /// Extension whitelist for named attachments. Extension-less image
    /// parts are always allowed after a signature check.
    #[serde(default = "default_allowed_exts")]
    pub allowed_attachment_exts: Vec<String>,

    /// Failure count at which a record becomes dead-letter.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Location of the local state database.
    #[serde(default = "default_state_db_path")]
    pub state_db_path: PathBuf,

    /// Override for the Envelope Index location. Discovered under the
    /// user's home directory when unset.
    #[serde(default)]
    pub mail_index_path: Option<PathBuf>,
}

fn default_sync_mailboxes() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_poll_interval() -> u64 {
    5
}

fn default_script_timeout() -> u64 {
    200
}

fn default_init_batch_size() -> u32 {
    50
}

fn default_max_attachment_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_allowed_exts() -> Vec<String> {
    [
        ".pdf", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".svg", ".docx", ".xlsx",
        ".pptx", ".csv", ".txt", ".zip", ".7z", ".mp4", ".mov", ".eml", ".ics",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_retries() -> u32 {
    5
}

fn default_state_db_path() -> PathBuf {
    PathBuf::from("data/despacho.db")
}

impl Config {
    /// Load and validate the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw)?;

        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.trim().is_empty() {
                config.notion_token = token.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.notion_token.trim().is_empty() {
            return Err(ConfigError::Missing("notion_token"));
        }
        if self.email_database_id.trim().is_empty() {
            return Err(ConfigError::Missing("email_database_id"));
        }
        if self.user_email.trim().is_empty() {
            return Err(ConfigError::Missing("user_email"));
        }
        if self.mail_account_name.trim().is_empty() {
            return Err(ConfigError::Missing("mail_account_name"));
        }
        if self.sync_mailboxes.is_empty() {
            return Err(ConfigError::Invalid {
                option: "sync_mailboxes",
                reason: "at least one mailbox is required".to_string(),
            });
        }
        if self.poll_interval_s == 0 {
            return Err(ConfigError::Invalid {
                option: "poll_interval_s",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.script_timeout_s == 0 {
            return Err(ConfigError::Invalid {
                option: "script_timeout_s",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                option: "max_retries",
                reason: "must be at least one".to_string(),
            });
        }
        Ok(())
    }

    /// The sync horizon as a UTC instant (midnight at the start of
    /// `sync_start_date`), if one is configured.
    pub fn sync_horizon(&self) -> Option<DateTime<Utc>> {
        self.sync_start_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }
}
