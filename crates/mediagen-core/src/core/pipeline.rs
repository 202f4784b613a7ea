//! Generation Pipeline
//!
//! Facade wiring the executor and the usage ledger together:
//! check limits -> execute -> record -> save.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::cache::ContentCache;
use crate::core::config::PipelineConfig;
use crate::core::jobs::{GenerationCall, JobExecutor, JobOutcome};
use crate::core::queue::QueueClient;
use crate::core::uploads::{ObjectUploader, UploadDeduplicator};
use crate::core::usage::{LimitCheck, PricingRegistry, RecordedUsage, UsageLedger, UsageMetrics};
use crate::core::CoreResult;

/// Output of [`GenerationPipeline::generate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub outcome: JobOutcome,
    pub usage: RecordedUsage,
    /// Limit state observed before execution
    pub limit_check: LimitCheck,
}

/// Limit-aware generation entry point
pub struct GenerationPipeline {
    cache: Arc<ContentCache>,
    executor: JobExecutor,
    ledger: UsageLedger,
    max_concurrency: usize,
}

impl GenerationPipeline {
    pub fn new(cache: Arc<ContentCache>, executor: JobExecutor, ledger: UsageLedger) -> Self {
        Self {
            cache,
            executor,
            ledger,
            max_concurrency: 1,
        }
    }

    /// Builds the full stack from configuration
    pub fn from_config(
        config: &PipelineConfig,
        client: Arc<dyn QueueClient>,
        uploader: Option<Arc<dyn ObjectUploader>>,
        pricing: PricingRegistry,
    ) -> Self {
        let cache = Arc::new(ContentCache::open(&config.cache_dir));

        let mut executor =
            JobExecutor::new(cache.clone(), client).with_config(config.executor_config());
        if let Some(uploader) = uploader {
            let uploads =
                UploadDeduplicator::new(cache.clone(), uploader).with_ttl(config.upload_ttl());
            executor = executor.with_uploads(Arc::new(uploads));
        }

        let ledger = UsageLedger::new(&config.usage_dir, config.limits.clone(), pricing)
            .with_tracking(config.track_usage);

        Self {
            cache,
            executor,
            ledger,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Runs one call under the daily limits and records its usage.
    ///
    /// Fails with `UsageLimitExceeded` before anything is submitted when the
    /// call would cross a limit. Unpriceable calls are checked at zero cost.
    pub async fn generate(
        &self,
        call: GenerationCall,
        metrics: UsageMetrics,
    ) -> CoreResult<GenerationResult> {
        let estimate = self.ledger.estimate_cost(&metrics).await.unwrap_or(0.0);
        let limit_check = self
            .ledger
            .assert_limits_with_cost(metrics.resource_type, estimate)
            .await?;

        let outcome = self.executor.execute_durable(call).await?;

        let mut metrics = metrics.with_cached(outcome.cached);
        if let Some(request_id) = &outcome.request_id {
            metrics = metrics.with_request_id(request_id.clone());
        }

        // The job already ran; persistence problems must not discard its output
        let usage = self.ledger.record(metrics).await;
        if let Err(e) = self.ledger.save().await {
            warn!("Failed to save usage: {}", e);
        }

        info!(
            "Generation complete in {}ms (recovered {}, cached {})",
            outcome.elapsed_ms, outcome.recovered, outcome.cached
        );

        Ok(GenerationResult {
            outcome,
            usage,
            limit_check,
        })
    }

    /// Runs several generations with the configured concurrency. Results
    /// keep input order.
    pub async fn generate_batch(
        &self,
        requests: Vec<(GenerationCall, UsageMetrics)>,
    ) -> Vec<CoreResult<GenerationResult>> {
        use futures::stream::{self, StreamExt};

        stream::iter(
            requests
                .into_iter()
                .map(|(call, metrics)| self.generate(call, metrics)),
        )
        .buffered(self.max_concurrency)
        .collect()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::{MockQueueClient, QueueStatus};
    use crate::core::usage::{DailyLimits, LimitType, PriceUnit, StaticPriceTable, UnitPrice};
    use crate::core::{CoreError, ResourceType};
    use serde_json::json;
    use tempfile::TempDir;

    fn pricing() -> PricingRegistry {
        let mut registry = PricingRegistry::new();
        registry.register(Arc::new(
            StaticPriceTable::new("fal")
                .with_price("fal-ai/flux/dev", UnitPrice::new(0.25, PriceUnit::PerImage)),
        ));
        registry
    }

    fn config(dir: &TempDir, limits: DailyLimits) -> PipelineConfig {
        PipelineConfig {
            cache_dir: dir.path().join("cache"),
            usage_dir: dir.path().join("usage"),
            limits,
            poll_interval_ms: 100,
            ..Default::default()
        }
    }

    fn flux(count: u32) -> UsageMetrics {
        UsageMetrics::new("fal", "fal-ai/flux/dev", ResourceType::Image).with_count(count)
    }

    #[tokio::test]
    async fn test_total_cost_block_happens_before_submission() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(MockQueueClient::new().with_script(vec![QueueStatus::Completed]));
        let pipeline = GenerationPipeline::from_config(
            &config(&dir, DailyLimits::default().with_limit(LimitType::TotalCost, 1.0)),
            client.clone(),
            None,
            pricing(),
        );

        let first = pipeline
            .generate(
                GenerationCall::new("fal-ai/flux/dev", json!({"prompt": "a", "num_images": 3})),
                flux(3),
            )
            .await
            .unwrap();
        assert_eq!(first.usage.record.estimated_cost, Some(0.75));
        assert_eq!(first.usage.record.request_id.as_deref(), Some("req-1"));

        let err = pipeline
            .generate(
                GenerationCall::new("fal-ai/flux/dev", json!({"prompt": "b", "num_images": 2})),
                flux(2),
            )
            .await
            .unwrap_err();

        match err {
            CoreError::UsageLimitExceeded {
                limit_type,
                current,
                limit,
            } => {
                assert_eq!(limit_type, LimitType::TotalCost);
                assert_eq!(current, 0.75);
                assert_eq!(limit, 1.0);
            }
            other => panic!("Expected UsageLimitExceeded, got {:?}", other),
        }
        assert_eq!(client.submit_count(), 1);

        // The first generation was flushed to disk
        let today = pipeline.ledger().today().await.unwrap();
        assert_eq!(today.counters.total_cost, 0.75);
        assert!(dir
            .path()
            .join("usage")
            .join(format!("{}.json", today.date))
            .exists());
    }

    #[tokio::test]
    async fn test_cached_result_is_recorded_as_cached() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(MockQueueClient::new().with_script(vec![QueueStatus::Completed]));
        let mut cfg = config(&dir, DailyLimits::default().with_limit(LimitType::Images, 5.0));
        cfg.result_ttl_secs = Some(3600);
        let pipeline = GenerationPipeline::from_config(&cfg, client.clone(), None, pricing());

        let call = GenerationCall::new("fal-ai/flux/dev", json!({"prompt": "same"}));
        let first = pipeline.generate(call.clone(), flux(1)).await.unwrap();
        let second = pipeline.generate(call, flux(1)).await.unwrap();

        assert!(!first.outcome.cached);
        assert!(second.outcome.cached);
        assert!(second.usage.record.cached);
        assert_eq!(second.usage.record.estimated_cost, Some(0.0));
        assert_eq!(pipeline.ledger().today().await.unwrap().counters.images, 1);
        assert_eq!(pipeline.ledger().session_records().await.len(), 2);
        assert_eq!(client.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_generate_batch() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(MockQueueClient::new());
        let pipeline = GenerationPipeline::from_config(
            &config(&dir, DailyLimits::default()),
            client.clone(),
            None,
            pricing(),
        )
        .with_max_concurrency(2);

        let requests = (0..3)
            .map(|i| {
                (
                    GenerationCall::new("fal-ai/flux/dev", json!({"prompt": i})),
                    flux(1),
                )
            })
            .collect();
        let results = pipeline.generate_batch(requests).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(pipeline.ledger().session_total_cost().await, 0.75);
        assert_eq!(client.submit_count(), 3);
    }

    #[tokio::test]
    async fn test_unwritable_usage_dir_keeps_output() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(MockQueueClient::new().with_result(json!({"images": ["a.png"]})));
        let mut cfg = config(&dir, DailyLimits::default().with_limit(LimitType::Images, 5.0));
        cfg.usage_dir = dir.path().join("usage-file");
        std::fs::write(&cfg.usage_dir, b"not a directory").unwrap();
        let pipeline = GenerationPipeline::from_config(&cfg, client.clone(), None, pricing());

        let result = pipeline
            .generate(
                GenerationCall::new("fal-ai/flux/dev", json!({"prompt": "kept"})),
                flux(1),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome.output, json!({"images": ["a.png"]}));
        assert_eq!(result.usage.record.estimated_cost, Some(0.25));
        assert!(pipeline.executor().pending_jobs().await.is_empty());
        assert!(pipeline.ledger().save().await.is_err());
    }
}
