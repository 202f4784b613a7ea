//! Durable Job Module
//!
//! Executes generation calls against provider queues and keeps a pending-job
//! record per fingerprint so interrupted calls re-attach instead of paying for
//! a second submission.

mod executor;

pub use executor::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::fingerprint::{Fingerprint, InputFile};
use crate::core::{now_ms, EndpointId, EpochMs, RequestId};

// =============================================================================
// Pending Job Record
// =============================================================================

/// Recovery anchor persisted between submission and confirmed completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJobRecord {
    /// Provider job handle
    pub request_id: RequestId,
    /// Provider + model identifier
    pub endpoint_id: EndpointId,
    /// Submission time (epoch ms)
    pub submitted_at: EpochMs,
}

impl PendingJobRecord {
    pub fn new(request_id: impl Into<String>, endpoint_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            endpoint_id: endpoint_id.into(),
            submitted_at: now_ms(),
        }
    }

    /// Milliseconds since submission
    pub fn age_ms(&self, now: EpochMs) -> i64 {
        now.saturating_sub(self.submitted_at).max(0)
    }
}

// =============================================================================
// Generation Call
// =============================================================================

/// One `(endpoint, parameters, files)` request
#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub endpoint: EndpointId,
    pub params: Value,
    pub files: Vec<InputFile>,
    /// When false the call skips fingerprinting, pending records and memoization
    pub durable: bool,
    pub cancel: Option<CancellationToken>,
}

impl GenerationCall {
    /// Creates a durable call without input files
    pub fn new(endpoint: impl Into<String>, params: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            params,
            files: Vec::new(),
            durable: true,
            cancel: None,
        }
    }

    /// Attaches an input file
    pub fn with_file(mut self, file: InputFile) -> Self {
        self.files.push(file);
        self
    }

    /// Replaces the input files
    pub fn with_files(mut self, files: Vec<InputFile>) -> Self {
        self.files = files;
        self
    }

    /// Sets whether the call takes part in caching and recovery
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the cancellation token
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fingerprint of this call; `None` for non-durable calls
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.durable.then(|| {
            crate::core::fingerprint::fingerprint(&self.endpoint, &self.params, &self.files)
        })
    }
}

// =============================================================================
// Outcome & Events
// =============================================================================

/// Result of a successful generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub fingerprint: Option<Fingerprint>,
    /// Provider job handle; `None` when served from the result cache
    pub request_id: Option<RequestId>,
    pub output: Value,
    /// Re-attached to a job submitted by an earlier call
    pub recovered: bool,
    /// Served from the result cache without touching the queue
    pub cached: bool,
    pub elapsed_ms: u64,
}

/// Progress notifications emitted by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    Submitted {
        endpoint: EndpointId,
        request_id: RequestId,
    },
    Recovered {
        endpoint: EndpointId,
        request_id: RequestId,
    },
    StatusChanged {
        request_id: RequestId,
        status: String,
        queue_position: Option<u32>,
    },
    Completed {
        request_id: Option<RequestId>,
        cached: bool,
    },
    Failed {
        request_id: Option<RequestId>,
        error: String,
    },
    StaleRecordDiscarded {
        fingerprint: Fingerprint,
        request_id: RequestId,
    },
}

// =============================================================================
// Configuration
// =============================================================================

/// Default delay between status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on how long a single call waits
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(600);

/// Default lifetime of a pending record (24 hours)
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Executor tuning
#[derive(Debug, Clone, PartialEq)]
pub struct JobExecutorConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub pending_ttl: Duration,
    /// Result memoization lifetime; `None` disables it
    pub result_ttl: Option<Duration>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
            pending_ttl: DEFAULT_PENDING_TTL,
            result_ttl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_record_json_shape() {
        let record = PendingJobRecord {
            request_id: "req-1".into(),
            endpoint_id: "fal-ai/flux/dev".into(),
            submitted_at: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            json!({
                "requestId": "req-1",
                "endpointId": "fal-ai/flux/dev",
                "submittedAt": 1_700_000_000_000i64,
            })
        );
        assert_eq!(record.age_ms(1_700_000_001_500), 1_500);
        assert_eq!(record.age_ms(0), 0);
    }

    #[test]
    fn test_non_durable_call_has_no_fingerprint() {
        let durable = GenerationCall::new("ep", json!({"prompt": "x"}));
        assert!(durable.fingerprint().is_some());

        let transient = durable.clone().with_durable(false);
        assert!(transient.fingerprint().is_none());
    }

    #[test]
    fn test_call_fingerprint_tracks_files() {
        let base = GenerationCall::new("ep", json!({"prompt": "x"}));
        let with_file = base
            .clone()
            .with_file(InputFile::remote("image_url", "https://cdn/a.png"));
        assert_ne!(base.fingerprint(), with_file.fingerprint());
    }

    #[test]
    fn test_event_serialization() {
        let event = JobEvent::Submitted {
            endpoint: "ep".into(),
            request_id: "r".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "submitted");
    }
}
