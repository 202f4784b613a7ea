//! Queue Transport
//!
//! Abstraction over asynchronous provider queues that expose
//! submit / status / result operations keyed by an opaque request id.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{HttpQueueClient, DEFAULT_QUEUE_BASE_URL};

#[cfg(feature = "http")]
pub(crate) use http::parse_api_error;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{CoreError, CoreResult, RequestId};

// =============================================================================
// Types
// =============================================================================

/// Acknowledgement of a queue submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub request_id: RequestId,
}

/// Status reported by the provider queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a worker
    Queued { position: Option<u32> },
    /// Being processed
    InProgress,
    /// Finished; the result can be fetched
    Completed,
    /// Finished unsuccessfully
    Failed { error: String },
    /// Unknown or expired request id
    NotFound,
}

impl QueueStatus {
    /// Whether the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed { .. } | QueueStatus::NotFound
        )
    }

    /// Short lowercase label for logs and events
    pub fn label(&self) -> &'static str {
        match self {
            QueueStatus::Queued { .. } => "queued",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed { .. } => "failed",
            QueueStatus::NotFound => "not_found",
        }
    }
}

// =============================================================================
// Client Trait
// =============================================================================

/// Client for a submit/poll/fetch-result provider queue
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Client name for diagnostics
    fn name(&self) -> &str;

    /// Submits a job and returns its request id
    async fn submit(&self, endpoint: &str, input: &Value) -> CoreResult<SubmittedJob>;

    /// Queries job status. Unknown or expired ids yield [`QueueStatus::NotFound`].
    async fn status(&self, endpoint: &str, request_id: &str) -> CoreResult<QueueStatus>;

    /// Fetches the output of a completed job
    async fn result(&self, endpoint: &str, request_id: &str) -> CoreResult<Value>;

    /// Asks the provider to cancel a job
    async fn cancel(&self, _endpoint: &str, _request_id: &str) -> CoreResult<()> {
        Err(CoreError::Validation(format!(
            "{} does not support cancellation",
            self.name()
        )))
    }
}

// =============================================================================
// Mock Client for Testing
// =============================================================================

#[derive(Debug, Clone)]
struct MockJob {
    /// Statuses returned by successive polls; the last one repeats
    statuses: VecDeque<QueueStatus>,
    result: Option<Value>,
}

#[derive(Debug, Default)]
struct MockState {
    jobs: HashMap<String, MockJob>,
    next_id: usize,
    script: Vec<QueueStatus>,
    result: Option<Value>,
    submissions: Vec<(String, Value)>,
    status_calls: usize,
    result_calls: usize,
    cancelled: Vec<String>,
    status_failures: usize,
    submit_failures: usize,
}

/// Scriptable in-memory queue that records every call
#[derive(Debug)]
pub struct MockQueueClient {
    state: Mutex<MockState>,
}

impl Default for MockQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockQueueClient {
    /// Creates a queue whose jobs report in-progress once, then complete
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                script: vec![QueueStatus::InProgress, QueueStatus::Completed],
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets the status sequence for newly submitted jobs
    pub fn with_script(self, script: Vec<QueueStatus>) -> Self {
        self.lock().script = script;
        self
    }

    /// Sets the output returned for newly submitted jobs
    pub fn with_result(self, result: Value) -> Self {
        self.lock().result = Some(result);
        self
    }

    /// Registers a job that exists upstream without being submitted here
    pub fn insert_job(&self, request_id: &str, statuses: Vec<QueueStatus>, result: Value) {
        self.lock().jobs.insert(
            request_id.to_string(),
            MockJob {
                statuses: statuses.into(),
                result: Some(result),
            },
        );
    }

    /// Drops a job so later lookups report not-found
    pub fn forget_job(&self, request_id: &str) {
        self.lock().jobs.remove(request_id);
    }

    /// Makes the next `n` status calls fail with a transient error
    pub fn fail_next_status(&self, n: usize) {
        self.lock().status_failures = n;
    }

    /// Makes the next `n` submissions fail with a transient error
    pub fn fail_next_submit(&self, n: usize) {
        self.lock().submit_failures = n;
    }

    pub fn submit_count(&self) -> usize {
        self.lock().submissions.len()
    }

    pub fn status_count(&self) -> usize {
        self.lock().status_calls
    }

    pub fn result_count(&self) -> usize {
        self.lock().result_calls
    }

    /// Inputs received by `submit`, in order
    pub fn submitted_inputs(&self) -> Vec<(String, Value)> {
        self.lock().submissions.clone()
    }

    /// Request ids passed to `cancel`
    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(&self, endpoint: &str, input: &Value) -> CoreResult<SubmittedJob> {
        let mut state = self.lock();
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(CoreError::QueueRequestFailed(
                "HTTP 503: queue temporarily unavailable".into(),
            ));
        }

        state.next_id += 1;
        let request_id = format!("req-{}", state.next_id);
        let job = MockJob {
            statuses: state.script.clone().into(),
            result: state.result.clone(),
        };
        state.jobs.insert(request_id.clone(), job);
        state
            .submissions
            .push((endpoint.to_string(), input.clone()));

        Ok(SubmittedJob { request_id })
    }

    async fn status(&self, _endpoint: &str, request_id: &str) -> CoreResult<QueueStatus> {
        let mut state = self.lock();
        state.status_calls += 1;
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(CoreError::QueueRequestFailed(
                "HTTP 502: upstream unavailable".into(),
            ));
        }

        let Some(job) = state.jobs.get_mut(request_id) else {
            return Ok(QueueStatus::NotFound);
        };
        let status = if job.statuses.len() > 1 {
            job.statuses.pop_front()
        } else {
            job.statuses.front().cloned()
        };
        Ok(status.unwrap_or(QueueStatus::Completed))
    }

    async fn result(&self, endpoint: &str, request_id: &str) -> CoreResult<Value> {
        let mut state = self.lock();
        state.result_calls += 1;
        let job = state
            .jobs
            .get(request_id)
            .ok_or_else(|| CoreError::JobNotFound {
                request_id: request_id.to_string(),
            })?;

        Ok(job.result.clone().unwrap_or_else(|| {
            json!({
                "request_id": request_id,
                "endpoint": endpoint,
            })
        }))
    }

    async fn cancel(&self, _endpoint: &str, request_id: &str) -> CoreResult<()> {
        self.lock().cancelled.push(request_id.to_string());
        Ok(())
    }
}
