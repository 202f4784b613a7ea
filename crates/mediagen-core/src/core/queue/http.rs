//! HTTP Queue Client
//!
//! Client for queue-style generation REST APIs:
//! - `POST {base}/{endpoint}` submits and returns a `request_id`
//! - `GET {base}/{endpoint}/requests/{id}/status` reports progress
//! - `GET {base}/{endpoint}/requests/{id}` returns the output
//! - `PUT {base}/{endpoint}/requests/{id}/cancel` cancels
//!
//! Transient failures (429, 502-504, timeouts) are retried with exponential
//! backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{QueueClient, QueueStatus, SubmittedJob};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Constants
// =============================================================================

/// Default base URL of the queue API
pub const DEFAULT_QUEUE_BASE_URL: &str = "https://queue.fal.run";

/// Maximum attempts for transient errors
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Per-request HTTP timeout
const REQUEST_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// API Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "id")]
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    queue_position: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

// =============================================================================
// Retry Helpers
// =============================================================================

/// Runs `f` up to `attempts` times, backing off between transient failures
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation: &str,
    attempts: u32,
    base_delay: Duration,
    f: F,
) -> CoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() || attempt >= attempts {
                    return Err(e);
                }

                let delay = base_delay * 2u32.pow(attempt - 1);
                warn!(
                    "{} attempt {} failed, retrying in {}ms: {}",
                    operation,
                    attempt,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Maps a reqwest transport error, tagging timeouts and connection failures
pub(crate) fn transport_error(context: &str, e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::QueueRequestFailed(format!("{}: request timeout: {}", context, e))
    } else if e.is_connect() {
        CoreError::QueueRequestFailed(format!("{}: connection failed: {}", context, e))
    } else {
        CoreError::QueueRequestFailed(format!("{}: network error: {}", context, e))
    }
}

/// Parses an error response body into a readable message
pub(crate) fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(err) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = err
            .message
            .or_else(|| err.detail.map(|d| value_to_message(&d)))
            .or_else(|| err.error.map(|e| value_to_message(&e)));
        if let Some(detail) = detail {
            return format!("HTTP {}: {}", status.as_u16(), detail);
        }
    }

    let truncated: String = body.chars().take(500).collect();
    format!("HTTP {}: {}", status.as_u16(), truncated)
}

fn value_to_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// HttpQueueClient
// =============================================================================

/// Queue client speaking the submit/status/result REST protocol
pub struct HttpQueueClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for HttpQueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQueueClient")
            .field("base_url", &self.base_url)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl HttpQueueClient {
    /// Creates a client for the default queue host
    pub fn new(api_key: impl Into<String>) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_QUEUE_BASE_URL.to_string(),
            max_retries: MAX_RETRIES,
            retry_delay: Duration::from_millis(BASE_RETRY_DELAY_MS),
        })
    }

    /// Set custom base URL
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set retry attempts and base backoff delay
    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = base_delay;
        self
    }

    fn submit_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_matches('/'))
    }

    fn request_url(&self, endpoint: &str, request_id: &str) -> String {
        format!(
            "{}/{}/requests/{}",
            self.base_url,
            endpoint.trim_matches('/'),
            request_id
        )
    }

    fn status_url(&self, endpoint: &str, request_id: &str) -> String {
        format!("{}/status", self.request_url(endpoint, request_id))
    }

    fn cancel_url(&self, endpoint: &str, request_id: &str) -> String {
        format!("{}/cancel", self.request_url(endpoint, request_id))
    }

    fn auth_header(&self) -> String {
        format!("Key {}", self.api_key)
    }

    /// Maps a provider status string onto [`QueueStatus`]
    fn map_status(response: StatusResponse) -> QueueStatus {
        match response.status.to_ascii_lowercase().as_str() {
            "in_queue" | "queued" | "pending" => QueueStatus::Queued {
                position: response.queue_position,
            },
            "in_progress" | "processing" | "running" => QueueStatus::InProgress,
            "completed" | "succeeded" | "success" => match response.error {
                Some(error) if !error.is_empty() => QueueStatus::Failed { error },
                _ => QueueStatus::Completed,
            },
            "failed" | "error" | "cancelled" | "canceled" => QueueStatus::Failed {
                error: response
                    .error
                    .unwrap_or_else(|| format!("Job {}", response.status.to_ascii_lowercase())),
            },
            "not_found" | "expired" => QueueStatus::NotFound,
            other => {
                warn!("Unknown queue status '{}', treating as in progress", other);
                QueueStatus::InProgress
            }
        }
    }

    async fn get_json(&self, url: &str, context: &str) -> CoreResult<(StatusCode, String)> {
        let resp = self
            .client
            .get(url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(context, e))?;
        Ok((status, body))
    }
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, endpoint: &str, input: &Value) -> CoreResult<SubmittedJob> {
        let url = self.submit_url(endpoint);

        let response = execute_with_retry("Queue submit", self.max_retries, self.retry_delay, || {
            let url = url.clone();
            async move {
                let resp = self
                    .client
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(input)
                    .send()
                    .await
                    .map_err(|e| transport_error("submit", e))?;

                let status = resp.status();
                let body = resp
                    .text()
                    .await
                    .map_err(|e| transport_error("submit", e))?;

                if !status.is_success() {
                    return Err(CoreError::QueueRequestFailed(parse_api_error(status, &body)));
                }

                serde_json::from_str::<SubmitResponse>(&body).map_err(|e| {
                    CoreError::QueueRequestFailed(format!("Failed to parse submit response: {}", e))
                })
            }
        })
        .await?;

        info!(
            "Queue job submitted to {}: request_id={}",
            endpoint, response.request_id
        );

        Ok(SubmittedJob {
            request_id: response.request_id,
        })
    }

    async fn status(&self, endpoint: &str, request_id: &str) -> CoreResult<QueueStatus> {
        let url = self.status_url(endpoint, request_id);

        let status = execute_with_retry("Queue status", self.max_retries, self.retry_delay, || {
            let url = url.clone();
            async move {
                let (status, body) = self.get_json(&url, "status").await?;

                if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                    return Ok(QueueStatus::NotFound);
                }
                if !status.is_success() {
                    return Err(CoreError::QueueRequestFailed(parse_api_error(status, &body)));
                }

                let parsed: StatusResponse = serde_json::from_str(&body).map_err(|e| {
                    CoreError::QueueRequestFailed(format!("Failed to parse status response: {}", e))
                })?;
                Ok(Self::map_status(parsed))
            }
        })
        .await?;

        debug!(
            "Queue status for {} on {}: {}",
            request_id,
            endpoint,
            status.label()
        );
        Ok(status)
    }

    async fn result(&self, endpoint: &str, request_id: &str) -> CoreResult<Value> {
        let url = self.request_url(endpoint, request_id);

        execute_with_retry("Queue result", self.max_retries, self.retry_delay, || {
            let url = url.clone();
            async move {
                let (status, body) = self.get_json(&url, "result").await?;

                if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                    return Err(CoreError::JobNotFound {
                        request_id: request_id.to_string(),
                    });
                }
                if !status.is_success() {
                    return Err(CoreError::QueueRequestFailed(parse_api_error(status, &body)));
                }

                serde_json::from_str::<Value>(&body).map_err(|e| {
                    CoreError::QueueRequestFailed(format!("Failed to parse result: {}", e))
                })
            }
        })
        .await
    }

    async fn cancel(&self, endpoint: &str, request_id: &str) -> CoreResult<()> {
        let url = self.cancel_url(endpoint, request_id);

        execute_with_retry("Queue cancel", self.max_retries, self.retry_delay, || {
            let url = url.clone();
            async move {
                let resp = self
                    .client
                    .put(&url)
                    .header("Authorization", self.auth_header())
                    .send()
                    .await
                    .map_err(|e| transport_error("cancel", e))?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(CoreError::QueueRequestFailed(parse_api_error(status, &body)));
                }
                Ok(())
            }
        })
        .await?;

        info!("Queue job cancelled: {} on {}", request_id, endpoint);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
