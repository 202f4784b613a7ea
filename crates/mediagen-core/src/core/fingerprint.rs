//! Request Fingerprinting
//!
//! Deterministic identity for a generation request: endpoint, parameters and
//! the ordered identities of its input files. Two calls with the same
//! fingerprint are the same logical request as far as caching and crash
//! recovery are concerned.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level parameter keys that never take part in request identity
/// (callbacks, timestamps, transport hints).
pub const VOLATILE_PARAM_KEYS: &[&str] = &[
    "webhookUrl",
    "webhook_url",
    "timestamp",
    "requestTimestamp",
    "signal",
    "abortSignal",
    "onQueueUpdate",
    "on_queue_update",
    "onProgress",
    "logs",
];

/// Content hash of raw bytes (xxh3-128, lowercase hex)
pub fn content_hash(data: &[u8]) -> String {
    format!("{:032x}", xxhash_rust::xxh3::xxh3_128(data))
}

// =============================================================================
// Input Files
// =============================================================================

/// Where an input file's content comes from
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSource {
    /// Already hosted; passed to the provider verbatim
    Remote { url: String },
    /// Raw bytes that must be uploaded first
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
}

impl FileSource {
    /// Stable tag distinguishing remote references from uploaded bytes
    pub fn kind(&self) -> &'static str {
        match self {
            FileSource::Remote { .. } => "remote",
            FileSource::Bytes { .. } => "bytes",
        }
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSource::Remote { url } => f.debug_struct("Remote").field("url", url).finish(),
            FileSource::Bytes { data, content_type } => f
                .debug_struct("Bytes")
                .field("len", &data.len())
                .field("content_type", content_type)
                .finish(),
        }
    }
}

/// An input file bound to the request parameter that receives its reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    /// Parameter name receiving the remote reference (e.g. `image_url`)
    pub field: String,
    /// File content
    pub source: FileSource,
}

impl InputFile {
    /// Creates an input that is already hosted remotely
    pub fn remote(field: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            source: FileSource::Remote { url: url.into() },
        }
    }

    /// Creates an input from raw bytes
    pub fn bytes(field: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            field: field.into(),
            source: FileSource::Bytes {
                data: data.into(),
                content_type: None,
            },
        }
    }

    /// Sets an explicit content type for byte inputs
    pub fn with_content_type(mut self, mime: impl Into<String>) -> Self {
        if let FileSource::Bytes { content_type, .. } = &mut self.source {
            *content_type = Some(mime.into());
        }
        self
    }

    /// Identity contribution: content hash for bytes, the reference for remote files
    pub fn identity(&self) -> String {
        match &self.source {
            FileSource::Remote { url } => url.clone(),
            FileSource::Bytes { data, .. } => content_hash(data),
        }
    }
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Opaque key identifying one logical generation request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps a previously computed key (e.g. read back from storage)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint of `(endpoint, params, files)`.
///
/// File order is significant. Object key order in `params` is not.
pub fn fingerprint(endpoint: &str, params: &Value, files: &[InputFile]) -> Fingerprint {
    let params = strip_volatile(params);
    // Structured entries so no field/identity split can alias another
    let file_hashes: Vec<(&str, &str, String)> = files
        .iter()
        .map(|f| (f.field.as_str(), f.source.kind(), f.identity()))
        .collect();

    // Serializing a tuple of plain JSON values cannot fail.
    let payload = serde_json::to_string(&(endpoint, &params, &file_hashes)).unwrap_or_default();
    Fingerprint(format!("{:032x}", xxhash_rust::xxh3::xxh3_128(payload.as_bytes())))
}

fn strip_volatile(params: &Value) -> Value {
    match params {
        Value::Object(map) => {
            let filtered: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !VOLATILE_PARAM_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            canonicalize(&Value::Object(filtered))
        }
        other => canonicalize(other),
    }
}

/// Rebuilds objects with sorted keys so serialization order never depends on
/// insertion order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
