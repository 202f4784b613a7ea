//! Crash Recovery Scenarios
//!
//! Restarts are simulated by building a fresh cache and executor over the
//! same cache directory while the provider queue keeps its state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::cache::{CacheNamespace, ContentCache};
use crate::core::fingerprint::InputFile;
use crate::core::jobs::{GenerationCall, JobEvent, JobExecutor, JobExecutorConfig, PendingJobRecord};
use crate::core::queue::{MockQueueClient, QueueStatus};
use crate::core::uploads::{MockUploader, UploadDeduplicator};
use crate::core::CoreError;

fn config(max_wait: Duration) -> JobExecutorConfig {
    JobExecutorConfig {
        poll_interval: Duration::from_millis(2),
        max_wait,
        ..Default::default()
    }
}

/// A process's view of the pipeline: fresh in-memory state over `dir`
fn boot(dir: &TempDir, client: &Arc<MockQueueClient>, max_wait: Duration) -> (Arc<ContentCache>, JobExecutor) {
    let cache = Arc::new(ContentCache::open(dir.path()));
    let executor = JobExecutor::new(cache.clone(), client.clone()).with_config(config(max_wait));
    (cache, executor)
}

fn video_call() -> GenerationCall {
    GenerationCall::new(
        "fal-ai/kling-video/v2/master/text-to-video",
        json!({"prompt": "a lighthouse in a storm", "duration": "5"}),
    )
}

#[tokio::test]
async fn test_timeout_then_restart_reattaches() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MockQueueClient::new().with_script(vec![QueueStatus::InProgress]));

    {
        let (cache, executor) = boot(&dir, &client, Duration::from_millis(20));
        let err = executor.execute_durable(video_call()).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(err.preserves_pending_record());
        assert_eq!(executor.pending_jobs().await.len(), 1);
        assert!(!cache.is_degraded());
    }

    // Provider finishes while we are down
    client.insert_job(
        "req-1",
        vec![QueueStatus::Completed],
        json!({"video": {"url": "https://cdn.example/v.mp4"}}),
    );

    let (_cache, executor) = boot(&dir, &client, Duration::from_secs(5));
    let outcome = executor.execute_durable(video_call()).await.unwrap();

    assert!(outcome.recovered);
    assert_eq!(outcome.request_id.as_deref(), Some("req-1"));
    assert_eq!(outcome.output["video"]["url"], "https://cdn.example/v.mp4");
    assert_eq!(client.submit_count(), 1);
    assert!(executor.pending_jobs().await.is_empty());
}

#[tokio::test]
async fn test_completed_record_recovers_without_resubmission() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MockQueueClient::new());
    client.insert_job(
        "req-crashed",
        vec![QueueStatus::Completed],
        json!({"images": [{"url": "https://cdn.example/a.png"}]}),
    );

    let call = video_call();
    let key = CacheNamespace::Pending.key(call.fingerprint().unwrap().as_str());
    ContentCache::open(dir.path())
        .set(
            &key,
            &PendingJobRecord::new("req-crashed", call.endpoint.as_str()),
            Some(Duration::from_secs(3600)),
        )
        .await;

    let (cache, executor) = boot(&dir, &client, Duration::from_secs(5));
    let outcome = executor.execute_durable(call).await.unwrap();

    assert!(outcome.recovered);
    assert_eq!(client.submit_count(), 0);
    assert_eq!(client.status_count(), 1);
    assert_eq!(client.result_count(), 1);
    assert!(cache.get_value(&key).await.is_none());
}

#[tokio::test]
async fn test_not_found_record_is_discarded_and_resubmitted() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MockQueueClient::new());
    let call = video_call();
    let fingerprint = call.fingerprint().unwrap();
    let key = CacheNamespace::Pending.key(fingerprint.as_str());

    ContentCache::open(dir.path())
        .set(&key, &PendingJobRecord::new("req-expired", call.endpoint.as_str()), None)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (cache, executor) = boot(&dir, &client, Duration::from_secs(5));
    let executor = executor.with_events(tx);

    let outcome = executor.execute_durable(call).await.unwrap();
    drop(executor);

    assert!(!outcome.recovered);
    assert_eq!(outcome.request_id.as_deref(), Some("req-1"));
    assert_eq!(client.submit_count(), 1);
    assert!(cache.get_value(&key).await.is_none());

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(
        events.first(),
        Some(&JobEvent::StaleRecordDiscarded {
            fingerprint,
            request_id: "req-expired".into(),
        })
    );
}

#[tokio::test]
async fn test_job_lost_upstream_is_resubmitted_after_restart() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MockQueueClient::new().with_script(vec![QueueStatus::InProgress]));
    let (_, executor) = boot(&dir, &client, Duration::from_millis(20));

    assert!(executor.execute_durable(video_call()).await.is_err());
    client.forget_job("req-1");

    // Recovery sees not-found, discards, and submits fresh
    let (_, executor) = boot(&dir, &client, Duration::from_millis(20));
    let err = executor.execute_durable(video_call()).await.unwrap_err();
    assert!(matches!(err, CoreError::Timeout { ref request_id, .. } if request_id == "req-2"));
    assert_eq!(client.submit_count(), 2);

    let pending = executor.pending_jobs().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1.request_id, "req-2");
}

#[tokio::test]
async fn test_cancelled_call_recovers_like_a_crash() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MockQueueClient::new().with_script(vec![QueueStatus::InProgress]));

    let token = CancellationToken::new();
    let (_, executor) = boot(&dir, &client, Duration::from_secs(5));
    let call = video_call().with_cancel(token.clone());

    let run = executor.execute_durable(call);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(run, cancel);
    assert!(matches!(result, Err(CoreError::Cancelled)));

    client.insert_job("req-1", vec![QueueStatus::Completed], json!({"ok": true}));
    let (_, executor) = boot(&dir, &client, Duration::from_secs(5));
    let outcome = executor.execute_durable(video_call()).await.unwrap();

    assert!(outcome.recovered);
    assert_eq!(outcome.output, json!({"ok": true}));
    assert_eq!(client.submit_count(), 1);
}

#[tokio::test]
async fn test_uploads_deduplicated_across_restart() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MockQueueClient::new());
    let uploader = Arc::new(MockUploader::new());
    let image = vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4];

    for prompt in ["animate slowly", "animate quickly"] {
        let (cache, executor) = boot(&dir, &client, Duration::from_secs(5));
        let executor = executor.with_uploads(Arc::new(UploadDeduplicator::new(
            cache,
            uploader.clone(),
        )));
        let call = GenerationCall::new("fal-ai/kling-video/image-to-video", json!({"prompt": prompt}))
            .with_file(InputFile::bytes("image_url", image.clone()));
        executor.execute_durable(call).await.unwrap();
    }

    assert_eq!(uploader.upload_count(), 1);
    assert_eq!(uploader.content_types(), vec!["image/jpeg".to_string()]);
    assert_eq!(client.submit_count(), 2);
}

#[tokio::test]
async fn test_degraded_cache_still_executes() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let client = Arc::new(MockQueueClient::new());
    let cache = Arc::new(ContentCache::open(blocker.join("cache")));
    let executor = JobExecutor::new(cache.clone(), client.clone()).with_config(config(Duration::from_secs(5)));

    let outcome = executor.execute_durable(video_call()).await.unwrap();
    assert!(!outcome.recovered);
    assert!(cache.is_degraded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_sharing_byte_input_keeps_cache_durable() {
    let dir = TempDir::new().unwrap();
    let client = Arc::new(MockQueueClient::new());
    let uploader = Arc::new(MockUploader::new());
    let (cache, executor) = boot(&dir, &client, Duration::from_secs(5));
    let executor = executor.with_uploads(Arc::new(UploadDeduplicator::new(
        cache.clone(),
        uploader.clone(),
    )));

    for round in 0..10 {
        let calls = ["wide shot", "close up"]
            .iter()
            .map(|prompt| {
                GenerationCall::new(
                    "fal-ai/kling-video/image-to-video",
                    json!({"prompt": prompt, "round": round}),
                )
                .with_file(InputFile::bytes("image_url", vec![7u8; 64]))
            })
            .collect();
        let results = executor.execute_batch(calls, 2).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }

    assert!(!cache.is_degraded());
    assert!(uploader.upload_count() >= 1);
}
