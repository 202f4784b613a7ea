//! Upload Deduplication
//!
//! Memoizes binary -> remote reference uploads by content hash so identical
//! payloads reach provider storage once per TTL window, across restarts.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpUploader;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::cache::{CacheNamespace, ContentCache};
use crate::core::fingerprint::{content_hash, FileSource, InputFile};
use crate::core::{CoreError, CoreResult};

/// Default lifetime of an upload memo (7 days)
pub const DEFAULT_UPLOAD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Content type used when nothing better is known
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

// =============================================================================
// Uploader Trait
// =============================================================================

/// Object-storage upload primitive of a provider
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    /// Uploader name for diagnostics
    fn name(&self) -> &str;

    /// Uploads bytes and returns the remote reference (URL)
    async fn upload(&self, data: &[u8], content_type: &str) -> CoreResult<String>;
}

// =============================================================================
// Content Type Sniffing
// =============================================================================

/// Guesses a MIME type from leading magic bytes
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        "audio/wav"
    } else if data.len() >= 8 && &data[4..8] == b"ftyp" {
        "video/mp4"
    } else if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
        "audio/mpeg"
    } else if data.starts_with(b"OggS") {
        "audio/ogg"
    } else {
        FALLBACK_CONTENT_TYPE
    }
}

// =============================================================================
// Upload Deduplicator
// =============================================================================

/// Content-hash keyed memo in front of an [`ObjectUploader`]
pub struct UploadDeduplicator {
    cache: Arc<ContentCache>,
    uploader: Arc<dyn ObjectUploader>,
    ttl: Duration,
}

impl UploadDeduplicator {
    pub fn new(cache: Arc<ContentCache>, uploader: Arc<dyn ObjectUploader>) -> Self {
        Self {
            cache,
            uploader,
            ttl: DEFAULT_UPLOAD_TTL,
        }
    }

    /// Sets the memo lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the remote reference for `data`, uploading only on a cache miss
    pub async fn upload(&self, data: &[u8], content_type: Option<&str>) -> CoreResult<String> {
        let hash = content_hash(data);
        let key = CacheNamespace::Upload.key(&hash);

        if let Some(reference) = self.cache.get::<String>(&key).await {
            debug!("Upload cache hit for {} ({} bytes)", hash, data.len());
            return Ok(reference);
        }

        let content_type = content_type.unwrap_or_else(|| sniff_content_type(data));
        let reference = self.uploader.upload(data, content_type).await?;
        info!(
            "Uploaded {} bytes ({}) via {}: {}",
            data.len(),
            content_type,
            self.uploader.name(),
            reference
        );

        self.cache.set(&key, &reference, Some(self.ttl)).await;
        Ok(reference)
    }

    /// Resolves a single input file to a remote reference
    pub async fn resolve(&self, file: &InputFile) -> CoreResult<String> {
        match &file.source {
            FileSource::Remote { url } => Ok(url.clone()),
            FileSource::Bytes { data, content_type } => {
                self.upload(data, content_type.as_deref()).await
            }
        }
    }

    /// Uploads byte inputs and writes every reference into `params[field]`
    pub async fn resolve_inputs(&self, params: &Value, files: &[InputFile]) -> CoreResult<Value> {
        if files.is_empty() {
            return Ok(params.clone());
        }
        if !params.is_object() {
            return Err(not_an_object());
        }

        let mut references = Vec::with_capacity(files.len());
        for file in files {
            references.push((file.field.as_str(), self.resolve(file).await?));
        }
        inject_references(params, references)
    }
}

fn not_an_object() -> CoreError {
    CoreError::Validation("Parameters must be a JSON object when files are attached".into())
}

/// Writes `(field, reference)` pairs into a copy of `params`.
///
/// A field with several references receives an array in the given order.
/// Fields named like `*_urls` always receive an array.
pub fn inject_references(params: &Value, references: Vec<(&str, String)>) -> CoreResult<Value> {
    let mut resolved = params.clone();
    if references.is_empty() {
        return Ok(resolved);
    }
    let map = resolved.as_object_mut().ok_or_else(not_an_object)?;

    let mut by_field: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (field, reference) in references {
        by_field.entry(field).or_default().push(reference);
    }

    for (field, mut refs) in by_field {
        let value = if refs.len() == 1 && !wants_array(field) {
            Value::String(refs.remove(0))
        } else {
            Value::Array(refs.into_iter().map(Value::String).collect())
        };
        map.insert(field.to_string(), value);
    }

    Ok(resolved)
}

fn wants_array(field: &str) -> bool {
    field.ends_with("_urls") || field.ends_with("Urls")
}

// =============================================================================
// Mock Uploader for Testing
// =============================================================================

/// In-memory uploader that counts physical uploads
#[derive(Debug, Default)]
pub struct MockUploader {
    uploads: AtomicUsize,
    fail_next: AtomicUsize,
    content_types: Mutex<Vec<String>>,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` uploads fail
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of physical uploads performed
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Content types seen, in upload order
    pub fn content_types(&self) -> Vec<String> {
        self.content_types
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectUploader for MockUploader {
    fn name(&self) -> &str {
        "mock"
    }

    async fn upload(&self, data: &[u8], content_type: &str) -> CoreResult<String> {
        let pending_failures = self.fail_next.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next.store(pending_failures - 1, Ordering::SeqCst);
            return Err(CoreError::UploadFailed("HTTP 503 from mock storage".into()));
        }

        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut types) = self.content_types.lock() {
            types.push(content_type.to_string());
        }
        Ok(format!(
            "https://storage.mock/{}/{}",
            n,
            &content_hash(data)[..12]
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn dedup_with(dir: &TempDir, uploader: Arc<MockUploader>) -> UploadDeduplicator {
        let cache = Arc::new(ContentCache::open(dir.path()));
        UploadDeduplicator::new(cache, uploader)
    }

    #[tokio::test]
    async fn test_identical_bytes_upload_once() {
        let dir = TempDir::new().unwrap();
        let uploader = Arc::new(MockUploader::new());
        let dedup = dedup_with(&dir, uploader.clone());

        let first = dedup.upload(b"same bytes", None).await.unwrap();
        let second = dedup.upload(b"same bytes", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(uploader.upload_count(), 1);

        dedup.upload(b"other bytes", None).await.unwrap();
        assert_eq!(uploader.upload_count(), 2);
    }

    #[tokio::test]
    async fn test_dedup_survives_restart() {
        let dir = TempDir::new().unwrap();
        let uploader = Arc::new(MockUploader::new());

        let before = dedup_with(&dir, uploader.clone())
            .upload(b"payload", None)
            .await
            .unwrap();
        let after = dedup_with(&dir, uploader.clone())
            .upload(b"payload", None)
            .await
            .unwrap();

        assert_eq!(before, after);
        assert_eq!(uploader.upload_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_memo_uploads_again() {
        let dir = TempDir::new().unwrap();
        let uploader = Arc::new(MockUploader::new());
        let dedup = dedup_with(&dir, uploader.clone()).with_ttl(Duration::from_millis(20));

        dedup.upload(b"payload", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        dedup.upload(b"payload", None).await.unwrap();

        assert_eq!(uploader.upload_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_upload_is_not_memoized() {
        let dir = TempDir::new().unwrap();
        let uploader = Arc::new(MockUploader::new());
        uploader.fail_next(1);
        let dedup = dedup_with(&dir, uploader.clone());

        assert!(dedup.upload(b"payload", None).await.is_err());
        assert!(dedup.upload(b"payload", None).await.is_ok());
        assert_eq!(uploader.upload_count(), 1);
    }

    #[tokio::test]
    async fn test_content_type_sniffed_when_missing() {
        let dir = TempDir::new().unwrap();
        let uploader = Arc::new(MockUploader::new());
        let dedup = dedup_with(&dir, uploader.clone());

        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        dedup.upload(&png, None).await.unwrap();
        dedup.upload(b"plain", Some("text/plain")).await.unwrap();

        assert_eq!(
            uploader.content_types(),
            vec!["image/png".to_string(), "text/plain".to_string()]
        );
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WAVEfmt "), "audio/wav");
        assert_eq!(sniff_content_type(b"\0\0\0\x20ftypisom"), "video/mp4");
        assert_eq!(sniff_content_type(b"ID3\x04"), "audio/mpeg");
        assert_eq!(sniff_content_type(b"hello"), FALLBACK_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_resolve_inputs_injects_references() {
        let dir = TempDir::new().unwrap();
        let uploader = Arc::new(MockUploader::new());
        let dedup = dedup_with(&dir, uploader.clone());

        let files = vec![
            InputFile::bytes("image_url", b"first".to_vec()),
            InputFile::remote("image_urls", "https://cdn.example/a.png"),
            InputFile::remote("audio_url", "https://cdn.example/a.wav"),
            InputFile::remote("audio_url", "https://cdn.example/b.wav"),
        ];
        let resolved = dedup
            .resolve_inputs(&json!({"prompt": "x"}), &files)
            .await
            .unwrap();

        assert_eq!(resolved["prompt"], "x");
        assert!(resolved["image_url"]
            .as_str()
            .unwrap()
            .starts_with("https://storage.mock/1/"));
        assert_eq!(resolved["image_urls"], json!(["https://cdn.example/a.png"]));
        assert_eq!(
            resolved["audio_url"],
            json!(["https://cdn.example/a.wav", "https://cdn.example/b.wav"])
        );
        assert_eq!(uploader.upload_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_inputs_requires_object_params() {
        let dir = TempDir::new().unwrap();
        let dedup = dedup_with(&dir, Arc::new(MockUploader::new()));

        let files = vec![InputFile::remote("image_url", "https://cdn.example/a.png")];
        let result = dedup.resolve_inputs(&json!("prompt"), &files).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));

        // Without files any params pass through
        let passthrough = dedup.resolve_inputs(&json!("prompt"), &[]).await.unwrap();
        assert_eq!(passthrough, json!("prompt"));
    }
}
