//! Notion API client.
//!
//! Thin typed wrapper over the HTTPS JSON API: page creation and update,
//! block children appends, database queries by an indexed text property,
//! and the three-step file upload. Transient failures (429, 5xx,
//! transport) are retried in-request with jittered exponential backoff,
//! at most three attempts. Authentication rejections are surfaced
//! unretried so the caller can decide when the process should give up.
//! All requests pass a shared token bucket so the service stays inside
//! the remote rate limit.

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const BASE_URL: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
/// Service cap on single-file uploads.
const MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;
/// Sustained write rate.
const REQUESTS_PER_SECOND: f64 = 3.0;

#[derive(Error, Debug)]
pub enum NotionError {
    #[error("authentication rejected (status {0})")]
    Auth(u16),

    #[error("request rejected: {0}")]
    Validation(String),

    #[error("server error (status {0}), retries exhausted")]
    Server(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("file too large for upload: {0} bytes")]
    FileTooLarge(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NotionError {
    /// Whether this failure means the credential is bad (no point
    /// retrying the record until an operator intervenes).
    pub fn is_auth(&self) -> bool {
        matches!(self, NotionError::Auth(_))
    }
}

/// Remote database operations the projector depends on. The production
/// implementation is [`NotionClient`]; tests substitute their own.
#[async_trait]
pub trait NotionApi: Send + Sync {
    /// Create a page and return its id.
    async fn create_page(
        &self,
        database_id: &str,
        properties: Value,
        children: Vec<Value>,
    ) -> Result<String, NotionError>;

    /// Patch the properties of an existing page.
    async fn update_page(&self, page_id: &str, properties: Value) -> Result<(), NotionError>;

    /// Append block children to a page.
    async fn append_children(&self, page_id: &str, children: Vec<Value>)
        -> Result<(), NotionError>;

    /// Find the first page whose rich-text `property` equals `value`.
    async fn find_page_by_text(
        &self,
        database_id: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<String>, NotionError>;

    /// Three-step file upload; returns the upload handle to reference
    /// from a property or block.
    async fn upload_file(&self, path: &Path, filename: &str) -> Result<String, NotionError>;
}

/// Token bucket shared by all requests.
struct RateLimiter {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(rate: f64) -> Self {
        Self {
            tokens: rate,
            capacity: rate,
            refill_per_sec: rate,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, returning how long to wait first if none is
    /// available yet.
    fn take(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Production client over `reqwest`.
pub struct NotionClient {
    http: reqwest::Client,
    token: String,
    limiter: Mutex<RateLimiter>,
}

impl NotionClient {
    pub fn new(token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            token,
            limiter: Mutex::new(RateLimiter::new(REQUESTS_PER_SECOND)),
        }
    }

    async fn acquire_slot(&self) {
        loop {
            let wait = self.limiter.lock().await.take();
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Issue one JSON request with bounded retry on transient failures.
    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, NotionError> {
        let url = format!("{}{}", BASE_URL, path);
        let mut last_failure: Option<NotionError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                debug!(path, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
            }
            self.acquire_slot().await;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .header("Notion-Version", NOTION_VERSION);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(path, attempt, error = %e, "transport failure");
                    last_failure = Some(NotionError::Transport(e));
                    continue;
                }
                Err(e) => return Err(NotionError::Transport(e)),
            };

            let status = response.status();
            match classify_status(status) {
                StatusClass::Ok => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(NotionError::Transport);
                }
                StatusClass::Auth => return Err(NotionError::Auth(status.as_u16())),
                StatusClass::Validation => {
                    let message = response
                        .json::<Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                        .unwrap_or_else(|| format!("status {}", status));
                    return Err(NotionError::Validation(message));
                }
                StatusClass::Transient => {
                    warn!(path, attempt, status = status.as_u16(), "transient remote failure");
                    last_failure = Some(NotionError::Server(status.as_u16()));
                }
                StatusClass::Other => {
                    return Err(NotionError::UnexpectedResponse(format!(
                        "status {} from {}",
                        status, path
                    )));
                }
            }
        }

        Err(last_failure.unwrap_or_else(|| {
            NotionError::UnexpectedResponse("retry loop exhausted without failure".to_string())
        }))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StatusClass {
    Ok,
    Auth,
    Validation,
    Transient,
    Other,
}

fn classify_status(status: StatusCode) -> StatusClass {
    match status.as_u16() {
        200..=299 => StatusClass::Ok,
        401 | 403 => StatusClass::Auth,
        400 => StatusClass::Validation,
        429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Other,
    }
}

/// Exponential backoff with jitter: 500ms * 2^(attempt-1) plus up to
/// 250ms of noise.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(500 * (1 << (attempt - 1).min(4)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}

#[async_trait]
impl NotionApi for NotionClient {
    async fn create_page(
        &self,
        database_id: &str,
        properties: Value,
        children: Vec<Value>,
    ) -> Result<String, NotionError> {
        let mut body = json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });
        if !children.is_empty() {
            body["children"] = Value::Array(children);
        }

        let page = self
            .send_json(reqwest::Method::POST, "/pages", Some(&body))
            .await?;
        page.get("id")
            .and_then(|id| id.as_str())
            .map(String::from)
            .ok_or_else(|| NotionError::UnexpectedResponse("page create without id".to_string()))
    }

    async fn update_page(&self, page_id: &str, properties: Value) -> Result<(), NotionError> {
        let body = json!({ "properties": properties });
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/pages/{}", page_id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn append_children(
        &self,
        page_id: &str,
        children: Vec<Value>,
    ) -> Result<(), NotionError> {
        let body = json!({ "children": children });
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/blocks/{}/children", page_id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn find_page_by_text(
        &self,
        database_id: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<String>, NotionError> {
        let body = json!({
            "filter": {
                "property": property,
                "rich_text": { "equals": value }
            },
            "page_size": 1,
        });
        let result = self
            .send_json(
                reqwest::Method::POST,
                &format!("/databases/{}/query", database_id),
                Some(&body),
            )
            .await?;
        Ok(result
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|r| r.first())
            .and_then(|page| page.get("id"))
            .and_then(|id| id.as_str())
            .map(String::from))
    }

    async fn upload_file(&self, path: &Path, filename: &str) -> Result<String, NotionError> {
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len() as u64;
        if size > MAX_UPLOAD_BYTES {
            return Err(NotionError::FileTooLarge(size));
        }

        // Step 1: request an upload handle.
        let created = self
            .send_json(
                reqwest::Method::POST,
                "/file_uploads",
                Some(&json!({ "filename": filename })),
            )
            .await?;
        let upload_id = created
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| NotionError::UnexpectedResponse("upload create without id".to_string()))?
            .to_string();
        let upload_url = created
            .get("upload_url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                NotionError::UnexpectedResponse("upload create without upload_url".to_string())
            })?
            .to_string();

        // Step 2: stream the bytes to the handle. Same transient-retry
        // policy as JSON requests; the form is rebuilt per attempt.
        let mut last_failure: Option<NotionError> = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            self.acquire_slot().await;

            let part = reqwest::multipart::Part::bytes(bytes.clone())
                .file_name(filename.to_string())
                .mime_str("application/octet-stream")
                .map_err(NotionError::Transport)?;
            let form = reqwest::multipart::Form::new().part("file", part);

            let response = match self
                .http
                .post(&upload_url)
                .bearer_auth(&self.token)
                .header("Notion-Version", NOTION_VERSION)
                .multipart(form)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_failure = Some(NotionError::Transport(e));
                    continue;
                }
                Err(e) => return Err(NotionError::Transport(e)),
            };

            let status = response.status();
            match classify_status(status) {
                StatusClass::Ok => {
                    debug!(filename, size, upload_id = %upload_id, "file uploaded");
                    // Step 3 is the caller's: reference the handle in a
                    // property or block.
                    return Ok(upload_id);
                }
                StatusClass::Auth => return Err(NotionError::Auth(status.as_u16())),
                StatusClass::Validation => {
                    return Err(NotionError::Validation(format!(
                        "upload rejected with status {}",
                        status
                    )))
                }
                StatusClass::Transient => {
                    last_failure = Some(NotionError::Server(status.as_u16()));
                }
                StatusClass::Other => {
                    return Err(NotionError::UnexpectedResponse(format!(
                        "upload status {}",
                        status
                    )))
                }
            }
        }

        Err(last_failure.unwrap_or_else(|| {
            NotionError::UnexpectedResponse("upload retry loop exhausted".to_string())
        }))
    }
}
