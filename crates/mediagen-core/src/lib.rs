//! Mediagen Core Library
//!
//! Durable generation request pipeline for AI media providers.
//! Callers hand in an `(endpoint, parameters, files)` triple and get back the
//! provider's output, with request fingerprinting, content-addressed caching,
//! crash-recoverable queue jobs and a daily usage ledger in between.
//!
//! ## Cross-process guarantees
//!
//! Pending-job records make a single caller's retries and crash restarts safe:
//! a re-run with the same fingerprint re-attaches to the job that was already
//! submitted. Two independent processes racing on the same fingerprint may
//! still both submit, since no lock or lease is taken.

pub mod core;

pub use crate::core::{
    cache::{CacheBackend, ContentCache, FileCacheBackend, MemoryCacheBackend},
    config::PipelineConfig,
    fingerprint::{content_hash, fingerprint, FileSource, Fingerprint, InputFile},
    jobs::{GenerationCall, JobEvent, JobExecutor, JobExecutorConfig, JobOutcome, PendingJobRecord},
    pipeline::GenerationPipeline,
    queue::{QueueClient, QueueStatus, SubmittedJob},
    uploads::{ObjectUploader, UploadDeduplicator},
    usage::{
        DailyLimits, DailyUsageState, GenerationRecord, LimitCheck, LimitType, PriceLookup,
        PricingRegistry, UsageLedger, UsageMetrics,
    },
    CoreError, CoreResult, ResourceType,
};

#[cfg(feature = "http")]
pub use crate::core::{queue::HttpQueueClient, uploads::HttpUploader};
