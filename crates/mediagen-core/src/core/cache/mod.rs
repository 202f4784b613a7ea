//! Content-Addressed Cache
//!
//! Durable key/value store with TTL support shared by upload memoization,
//! pending-job records and result memoization.
//!
//! The cache never surfaces errors. The first backend failure (I/O,
//! permissions, corruption) switches the instance to an in-process store for
//! the rest of its lifetime and logs the switch once.

mod backend;

pub use backend::{CacheBackend, CacheEntry, FileCacheBackend, MemoryCacheBackend};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{now_ms, CoreError};

// =============================================================================
// Key Namespaces
// =============================================================================

/// Logical key spaces sharing one cache root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    /// content hash -> remote reference
    Upload,
    /// fingerprint -> pending job record
    Pending,
    /// fingerprint -> completed output
    Result,
}

impl CacheNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheNamespace::Upload => "upload:",
            CacheNamespace::Pending => "pending:",
            CacheNamespace::Result => "result:",
        }
    }

    /// Builds the full cache key for an id in this namespace
    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix(), id)
    }
}

// =============================================================================
// Content Cache
// =============================================================================

/// Key/value cache with permanent in-memory fallback
pub struct ContentCache {
    primary: Arc<dyn CacheBackend>,
    fallback: MemoryCacheBackend,
    degraded: AtomicBool,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("primary", &self.primary.name())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl ContentCache {
    /// Creates a cache over any backend
    pub fn new(primary: Arc<dyn CacheBackend>) -> Self {
        Self {
            primary,
            fallback: MemoryCacheBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Creates a file-backed cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileCacheBackend::new(root)))
    }

    /// Creates a purely in-memory cache
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()))
    }

    /// Whether the cache has fallen back to the in-process store
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn backend(&self) -> &dyn CacheBackend {
        if self.is_degraded() {
            &self.fallback
        } else {
            self.primary.as_ref()
        }
    }

    fn degrade(&self, error: &CoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                "Cache backend '{}' failed, using in-memory cache for the rest of this process: {}",
                self.primary.name(),
                error
            );
        }
    }

    /// Reads a raw JSON value. Expired entries read as a miss and are removed.
    pub async fn get_value(&self, key: &str) -> Option<Value> {
        let entry = match self.backend().read(key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.degrade(&e);
                self.fallback.read(key).await.ok().flatten()
            }
        }?;

        if entry.is_expired(now_ms()) {
            debug!("Cache entry expired: {}", key);
            self.delete(key).await;
            return None;
        }

        Some(entry.value)
    }

    /// Reads and deserializes a value. A value of the wrong shape is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Ignoring cache entry {} with unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Stores a value, replacing any previous entry for the key
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize cache value for {}: {}", key, e);
                return;
            }
        };

        let entry = CacheEntry::new(key, value, ttl, now_ms());
        if let Err(e) = self.backend().write(&entry).await {
            self.degrade(&e);
            let _ = self.fallback.write(&entry).await;
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.backend().remove(key).await {
            self.degrade(&e);
            let _ = self.fallback.remove(key).await;
        }
    }

    async fn all_entries(&self) -> Vec<CacheEntry> {
        match self.backend().entries().await {
            Ok(entries) => entries,
            Err(e) => {
                self.degrade(&e);
                self.fallback.entries().await.unwrap_or_default()
            }
        }
    }

    /// Live keys starting with `prefix`, sorted
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = now_ms();
        let mut keys: Vec<String> = self
            .all_entries()
            .await
            .into_iter()
            .filter(|e| e.key.starts_with(prefix) && !e.is_expired(now))
            .map(|e| e.key)
            .collect();
        keys.sort();
        keys
    }

    /// Removes every expired entry, returning how many were removed
    pub async fn prune_expired(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = self
            .all_entries()
            .await
            .into_iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key)
            .collect();

        for key in &expired {
            self.delete(key).await;
        }
        expired.len()
    }

    /// Removes every entry
    pub async fn clear(&self) {
        if let Err(e) = self.backend().clear().await {
            self.degrade(&e);
            let _ = self.fallback.clear().await;
        }
    }
}
