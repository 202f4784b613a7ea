//! Cache Backends
//!
//! Durable one-file-per-key storage and the in-process volatile store used
//! as a fallback.
//! Storage: `{cache_root}/{key-stem}-{key-hash}.json`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CoreError, CoreResult, EpochMs};

/// Maximum length of the readable part of an entry filename
const MAX_KEY_STEM_LEN: usize = 48;

// =============================================================================
// Cache Entry
// =============================================================================

/// A single stored value. Replaced wholesale on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Epoch milliseconds; 0 means no expiry
    #[serde(default)]
    pub expires_at: EpochMs,
}

impl CacheEntry {
    /// Creates an entry. A missing or zero TTL never expires.
    pub fn new(key: impl Into<String>, value: Value, ttl: Option<Duration>, now: EpochMs) -> Self {
        let expires_at = match ttl {
            Some(ttl) if !ttl.is_zero() => {
                now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
            }
            _ => 0,
        };
        Self {
            key: key.into(),
            value,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: EpochMs) -> bool {
        self.expires_at > 0 && now >= self.expires_at
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Storage primitive behind [`super::ContentCache`]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    async fn read(&self, key: &str) -> CoreResult<Option<CacheEntry>>;

    async fn write(&self, entry: &CacheEntry) -> CoreResult<()>;

    async fn remove(&self, key: &str) -> CoreResult<()>;

    /// All stored entries, expired ones included
    async fn entries(&self) -> CoreResult<Vec<CacheEntry>>;

    async fn clear(&self) -> CoreResult<()>;
}

// =============================================================================
// File Backend
// =============================================================================

/// One JSON document per key under a root directory
#[derive(Debug, Clone)]
pub struct FileCacheBackend {
    root: PathBuf,
}

impl FileCacheBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file path for a key.
    ///
    /// Keys are arbitrary strings, so the filename is a sanitized prefix plus
    /// a hash of the full key.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_KEY_STEM_LEN)
            .collect();
        let hash = xxhash_rust::xxh3::xxh3_64(key.as_bytes());
        self.root.join(format!("{}-{:016x}.json", stem, hash))
    }

    async fn ensure_dir(&self) -> CoreResult<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            CoreError::CacheBackend(format!(
                "Failed to create cache directory {}: {}",
                self.root.display(),
                e
            ))
        })
    }

    async fn read_path(path: &Path) -> CoreResult<Option<CacheEntry>> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CoreError::CacheBackend(format!(
                    "Failed to read cache entry {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let entry: CacheEntry = serde_json::from_slice(&content).map_err(|e| {
            CoreError::CacheBackend(format!(
                "Corrupted cache entry {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(entry))
    }
}

#[async_trait]
impl CacheBackend for FileCacheBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn read(&self, key: &str) -> CoreResult<Option<CacheEntry>> {
        let entry = Self::read_path(&self.entry_path(key)).await?;
        // A hash collision on the filename shows up as a foreign key.
        Ok(entry.filter(|e| e.key == key))
    }

    /// Writes atomically via temp file + rename
    async fn write(&self, entry: &CacheEntry) -> CoreResult<()> {
        self.ensure_dir().await?;

        let path = self.entry_path(&entry.key);
        // Unique per write: concurrent sets of one key must not share a temp file
        let temp_path = path.with_extension(format!(
            "json.tmp.{}.{}",
            std::process::id(),
            ulid::Ulid::new()
        ));
        let content = serde_json::to_vec(entry)?;

        tokio::fs::write(&temp_path, &content).await.map_err(|e| {
            CoreError::CacheBackend(format!(
                "Failed to write cache entry {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(CoreError::CacheBackend(format!(
                "Failed to rename cache entry {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            )));
        }

        Ok(())
    }

    async fn remove(&self, key: &str) -> CoreResult<()> {
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::CacheBackend(format!(
                "Failed to delete cache entry {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn entries(&self) -> CoreResult<Vec<CacheEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::CacheBackend(format!(
                    "Failed to list cache directory {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        let mut entries = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| CoreError::CacheBackend(format!("Failed to list cache entry: {}", e)))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = Self::read_path(&path).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn clear(&self) -> CoreResult<()> {
        for entry in self.entries().await? {
            self.remove(&entry.key).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

/// Volatile in-process store; lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A poisoned map still holds whole entries; keep using it.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &str) -> CoreResult<Option<CacheEntry>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn write(&self, entry: &CacheEntry) -> CoreResult<()> {
        self.lock().insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> CoreResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn entries(&self) -> CoreResult<Vec<CacheEntry>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn clear(&self) -> CoreResult<()> {
        self.lock().clear();
        Ok(())
    }
}
