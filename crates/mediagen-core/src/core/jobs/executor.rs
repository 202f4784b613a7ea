//! Durable Job Executor
//!
//! Per-fingerprint state machine:
//! `NoRecord -> Submitted -> {Queued, InProgress} -> {Completed, Failed, NotFound}`.
//!
//! The pending record is written right after submission and removed only
//! once the provider confirms success, failure or that the job is gone.
//! Timeouts, cancellation and transport errors leave it in place so the
//! next call with the same fingerprint re-attaches.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{GenerationCall, JobEvent, JobExecutorConfig, JobOutcome, PendingJobRecord};
use crate::core::cache::{CacheNamespace, ContentCache};
use crate::core::fingerprint::{FileSource, Fingerprint};
use crate::core::queue::{QueueClient, QueueStatus};
use crate::core::uploads::{inject_references, UploadDeduplicator};
use crate::core::{CoreError, CoreResult};

/// Runs generation calls against a provider queue with crash recovery
pub struct JobExecutor {
    cache: Arc<ContentCache>,
    client: Arc<dyn QueueClient>,
    uploads: Option<Arc<UploadDeduplicator>>,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
    config: JobExecutorConfig,
}

impl JobExecutor {
    pub fn new(cache: Arc<ContentCache>, client: Arc<dyn QueueClient>) -> Self {
        Self {
            cache,
            client,
            uploads: None,
            events: None,
            config: JobExecutorConfig::default(),
        }
    }

    /// Sets the deduplicator used for byte inputs
    pub fn with_uploads(mut self, uploads: Arc<UploadDeduplicator>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    /// Sets the channel receiving [`JobEvent`]s
    pub fn with_events(mut self, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_config(mut self, config: JobExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Executes a call, re-attaching to a previously submitted job when one
    /// exists for the same fingerprint.
    ///
    /// Cancelling the call's token aborts in-flight requests and returns
    /// [`CoreError::Cancelled`]; the pending record is kept.
    pub async fn execute_durable(&self, call: GenerationCall) -> CoreResult<JobOutcome> {
        let started = Instant::now();

        let result = match call.cancel.clone() {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        warn!("Generation call on {} cancelled", call.endpoint);
                        Err(CoreError::Cancelled)
                    }
                    result = self.run(&call, started) => result,
                }
            }
            None => self.run(&call, started).await,
        };

        if let Err(e) = &result {
            debug!("Generation call on {} ended with error: {}", call.endpoint, e);
        }
        result
    }

    /// Executes calls with at most `concurrency` in flight. Results keep
    /// input order.
    pub async fn execute_batch(
        &self,
        calls: Vec<GenerationCall>,
        concurrency: usize,
    ) -> Vec<CoreResult<JobOutcome>> {
        let concurrency = concurrency.max(1);
        info!(
            "Executing batch of {} calls (concurrency {})",
            calls.len(),
            concurrency
        );

        stream::iter(calls.into_iter().map(|call| self.execute_durable(call)))
            .buffered(concurrency)
            .collect()
            .await
    }

    /// Pending records currently stored, sorted by fingerprint
    pub async fn pending_jobs(&self) -> Vec<(Fingerprint, PendingJobRecord)> {
        list_pending(&self.cache).await
    }

    async fn run(&self, call: &GenerationCall, started: Instant) -> CoreResult<JobOutcome> {
        let Some(fingerprint) = call.fingerprint() else {
            return self.run_transient(call, started).await;
        };

        if self.config.result_ttl.is_some() {
            let result_key = CacheNamespace::Result.key(fingerprint.as_str());
            if let Some(output) = self.cache.get_value(&result_key).await {
                debug!("Result cache hit for {}", fingerprint);
                self.emit(JobEvent::Completed {
                    request_id: None,
                    cached: true,
                });
                return Ok(JobOutcome {
                    fingerprint: Some(fingerprint),
                    request_id: None,
                    output,
                    recovered: false,
                    cached: true,
                    elapsed_ms: elapsed_ms(started),
                });
            }
        }

        let pending_key = CacheNamespace::Pending.key(fingerprint.as_str());

        if let Some(record) = self.cache.get::<PendingJobRecord>(&pending_key).await {
            if let Some(outcome) = self
                .recover(&fingerprint, &pending_key, record, started)
                .await?
            {
                return Ok(outcome);
            }
        }

        let input = self.prepare_input(call).await?;
        let job = self.client.submit(&call.endpoint, &input).await?;

        let record = PendingJobRecord::new(&job.request_id, &call.endpoint);
        self.cache
            .set(&pending_key, &record, Some(self.config.pending_ttl))
            .await;

        info!(
            "Submitted job {} to {} (fingerprint {})",
            job.request_id, call.endpoint, fingerprint
        );
        self.emit(JobEvent::Submitted {
            endpoint: call.endpoint.clone(),
            request_id: job.request_id.clone(),
        });

        let output = self
            .await_job(&call.endpoint, &job.request_id, Some(&pending_key), None, started)
            .await?;

        Ok(self
            .finish(fingerprint, job.request_id, output, false, started)
            .await)
    }

    /// Tries to resume from a stored record. `Ok(None)` means the record was
    /// stale and a fresh submission is needed.
    async fn recover(
        &self,
        fingerprint: &Fingerprint,
        pending_key: &str,
        record: PendingJobRecord,
        started: Instant,
    ) -> CoreResult<Option<JobOutcome>> {
        let status = self
            .client
            .status(&record.endpoint_id, &record.request_id)
            .await?;

        match status {
            QueueStatus::NotFound => {
                info!(
                    "Discarding stale pending record for {} (job {} not found)",
                    fingerprint, record.request_id
                );
                self.discard(fingerprint, pending_key, record).await;
                Ok(None)
            }
            QueueStatus::Failed { error } => {
                warn!(
                    "Previous job {} for {} failed: {}",
                    record.request_id, fingerprint, error
                );
                self.cache.delete(pending_key).await;
                self.emit(JobEvent::Failed {
                    request_id: Some(record.request_id.clone()),
                    error: error.clone(),
                });
                Err(CoreError::JobFailed {
                    endpoint: record.endpoint_id,
                    request_id: record.request_id,
                    message: error,
                })
            }
            status => {
                info!(
                    "Recovering job {} for {} ({})",
                    record.request_id,
                    fingerprint,
                    status.label()
                );
                self.emit(JobEvent::Recovered {
                    endpoint: record.endpoint_id.clone(),
                    request_id: record.request_id.clone(),
                });

                let awaited = self
                    .await_job(
                        &record.endpoint_id,
                        &record.request_id,
                        Some(pending_key),
                        Some(status),
                        started,
                    )
                    .await;

                // Job vanished while re-attached: same as a stale record
                let output = match awaited {
                    Err(CoreError::JobNotFound { .. }) => {
                        info!(
                            "Job {} for {} disappeared while re-attached, resubmitting",
                            record.request_id, fingerprint
                        );
                        self.discard(fingerprint, pending_key, record).await;
                        return Ok(None);
                    }
                    other => other?,
                };

                Ok(Some(
                    self.finish(fingerprint.clone(), record.request_id, output, true, started)
                        .await,
                ))
            }
        }
    }

    async fn discard(&self, fingerprint: &Fingerprint, pending_key: &str, record: PendingJobRecord) {
        self.cache.delete(pending_key).await;
        self.emit(JobEvent::StaleRecordDiscarded {
            fingerprint: fingerprint.clone(),
            request_id: record.request_id,
        });
    }

    async fn run_transient(&self, call: &GenerationCall, started: Instant) -> CoreResult<JobOutcome> {
        let input = self.prepare_input(call).await?;
        let job = self.client.submit(&call.endpoint, &input).await?;
        info!("Submitted job {} to {}", job.request_id, call.endpoint);
        self.emit(JobEvent::Submitted {
            endpoint: call.endpoint.clone(),
            request_id: job.request_id.clone(),
        });

        let output = self
            .await_job(&call.endpoint, &job.request_id, None, None, started)
            .await?;

        self.emit(JobEvent::Completed {
            request_id: Some(job.request_id.clone()),
            cached: false,
        });
        Ok(JobOutcome {
            fingerprint: None,
            request_id: Some(job.request_id),
            output,
            recovered: false,
            cached: false,
            elapsed_ms: elapsed_ms(started),
        })
    }

    async fn finish(
        &self,
        fingerprint: Fingerprint,
        request_id: String,
        output: Value,
        recovered: bool,
        started: Instant,
    ) -> JobOutcome {
        if let Some(ttl) = self.config.result_ttl {
            let result_key = CacheNamespace::Result.key(fingerprint.as_str());
            self.cache.set(&result_key, &output, Some(ttl)).await;
        }

        self.emit(JobEvent::Completed {
            request_id: Some(request_id.clone()),
            cached: false,
        });

        JobOutcome {
            fingerprint: Some(fingerprint),
            request_id: Some(request_id),
            output,
            recovered,
            cached: false,
            elapsed_ms: elapsed_ms(started),
        }
    }

    /// Uploads byte inputs and injects every file reference into the params
    async fn prepare_input(&self, call: &GenerationCall) -> CoreResult<Value> {
        if call.files.is_empty() {
            return Ok(call.params.clone());
        }

        match &self.uploads {
            Some(uploads) => uploads.resolve_inputs(&call.params, &call.files).await,
            None => {
                let mut references = Vec::with_capacity(call.files.len());
                for file in &call.files {
                    match &file.source {
                        FileSource::Remote { url } => references.push((file.field.as_str(), url.clone())),
                        FileSource::Bytes { .. } => {
                            return Err(CoreError::Validation(format!(
                                "Input '{}' carries raw bytes but no uploader is configured",
                                file.field
                            )))
                        }
                    }
                }
                inject_references(&call.params, references)
            }
        }
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Polls until the job reaches a terminal state or the wait bound passes.
    ///
    /// `pending_key` is cleared on confirmed success, failure or not-found.
    async fn await_job(
        &self,
        endpoint: &str,
        request_id: &str,
        pending_key: Option<&str>,
        initial: Option<QueueStatus>,
        started: Instant,
    ) -> CoreResult<Value> {
        let mut next = initial;
        let mut last_reported: Option<QueueStatus> = None;

        loop {
            let status = match next.take() {
                Some(status) => status,
                None => self.client.status(endpoint, request_id).await?,
            };

            if last_reported.as_ref() != Some(&status) {
                debug!("Job {} is {}", request_id, status.label());
                self.emit(JobEvent::StatusChanged {
                    request_id: request_id.to_string(),
                    status: status.label().to_string(),
                    queue_position: match &status {
                        QueueStatus::Queued { position } => *position,
                        _ => None,
                    },
                });
                last_reported = Some(status.clone());
            }

            match status {
                QueueStatus::Completed => {
                    let result = self.client.result(endpoint, request_id).await;
                    match &result {
                        Ok(_) => self.clear_pending(pending_key).await,
                        Err(e) if !e.preserves_pending_record() => {
                            self.clear_pending(pending_key).await
                        }
                        Err(_) => {}
                    }
                    return result;
                }
                QueueStatus::Failed { error } => {
                    self.clear_pending(pending_key).await;
                    warn!("Job {} on {} failed: {}", request_id, endpoint, error);
                    self.emit(JobEvent::Failed {
                        request_id: Some(request_id.to_string()),
                        error: error.clone(),
                    });
                    return Err(CoreError::JobFailed {
                        endpoint: endpoint.to_string(),
                        request_id: request_id.to_string(),
                        message: error,
                    });
                }
                QueueStatus::NotFound => {
                    self.clear_pending(pending_key).await;
                    return Err(CoreError::JobNotFound {
                        request_id: request_id.to_string(),
                    });
                }
                QueueStatus::Queued { .. } | QueueStatus::InProgress => {}
            }

            let waited = started.elapsed();
            if waited >= self.config.max_wait {
                warn!(
                    "Gave up waiting for job {} after {}s; pending record kept",
                    request_id,
                    waited.as_secs()
                );
                return Err(CoreError::Timeout {
                    fingerprint: pending_key
                        .and_then(|k| k.strip_prefix(CacheNamespace::Pending.prefix()))
                        .unwrap_or_default()
                        .to_string(),
                    request_id: request_id.to_string(),
                    waited_secs: waited.as_secs(),
                });
            }

            let remaining = self.config.max_wait - waited;
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    async fn clear_pending(&self, pending_key: Option<&str>) {
        if let Some(key) = pending_key {
            self.cache.delete(key).await;
        }
    }
}

/// Pending records stored in `cache`, sorted by fingerprint
pub async fn list_pending(cache: &ContentCache) -> Vec<(Fingerprint, PendingJobRecord)> {
    let prefix = CacheNamespace::Pending.prefix();
    let mut jobs = Vec::new();
    for key in cache.keys_with_prefix(prefix).await {
        if let Some(record) = cache.get::<PendingJobRecord>(&key).await {
            let fingerprint = Fingerprint::from_raw(&key[prefix.len()..]);
            jobs.push((fingerprint, record));
        }
    }
    jobs
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
