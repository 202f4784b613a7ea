//! Mediagen Error Definitions
//!
//! Defines error types used throughout the pipeline.

use thiserror::Error;

use super::usage::LimitType;

/// Core pipeline error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Job Errors
    // =========================================================================
    /// The provider reported a terminal failure. Nothing is left to recover.
    #[error("Job {request_id} on {endpoint} failed: {message}")]
    JobFailed {
        endpoint: String,
        request_id: String,
        message: String,
    },

    /// Waiting for a job exceeded the configured bound. The pending record
    /// is kept so a later call re-attaches instead of resubmitting.
    #[error("Timed out after {waited_secs}s waiting for job {request_id} (fingerprint {fingerprint})")]
    Timeout {
        fingerprint: String,
        request_id: String,
        waited_secs: u64,
    },

    #[error("Job not found: {request_id}")]
    JobNotFound { request_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Usage Errors
    // =========================================================================
    #[error(
        "Daily {limit_type} limit reached ({current} of {limit}). Raise {} to allow more generations today",
        .limit_type.env_var()
    )]
    UsageLimitExceeded {
        limit_type: LimitType,
        current: f64,
        limit: f64,
    },

    #[error("Pricing unavailable for provider '{provider}': {reason}")]
    PricingUnavailable { provider: String, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    #[error("Queue request failed: {0}")]
    QueueRequestFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core pipeline result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Returns true when an error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        let message = match self {
            CoreError::QueueRequestFailed(msg) | CoreError::UploadFailed(msg) => msg,
            CoreError::Timeout { .. } => return true,
            _ => return false,
        };

        let lowered = message.to_ascii_lowercase();
        lowered.contains("429")
            || lowered.contains("502")
            || lowered.contains("503")
            || lowered.contains("504")
            || lowered.contains("timeout")
            || lowered.contains("timed out")
            || lowered.contains("connection")
            || lowered.contains("temporarily unavailable")
    }

    /// Whether a pending job record must be kept after this error.
    ///
    /// Only terminal provider failures and confirmed not-found clear it.
    pub fn preserves_pending_record(&self) -> bool {
        !matches!(
            self,
            CoreError::JobFailed { .. } | CoreError::JobNotFound { .. }
        )
    }
}
