//! Mediagen Core Type Definitions
//!
//! Defines fundamental types used throughout the pipeline.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Provider-assigned queue request identifier (opaque)
pub type RequestId = String;

/// Provider + model identifier, e.g. `fal-ai/flux/dev`
pub type EndpointId = String;

/// Generation record identifier (ULID)
pub type RecordId = String;

// =============================================================================
// Time Helpers
// =============================================================================

/// Milliseconds since the Unix epoch
pub type EpochMs = i64;

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> EpochMs {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Resource Types
// =============================================================================

/// Category of generated media, tracked independently for quota purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Image,
    Video,
    Speech,
    Music,
}

impl ResourceType {
    /// Returns all resource types
    pub fn all() -> [ResourceType; 4] {
        [
            ResourceType::Image,
            ResourceType::Video,
            ResourceType::Speech,
            ResourceType::Music,
        ]
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Image => "image",
            ResourceType::Video => "video",
            ResourceType::Speech => "speech",
            ResourceType::Music => "music",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" | "images" => Ok(ResourceType::Image),
            "video" | "videos" => Ok(ResourceType::Video),
            "speech" | "tts" => Ok(ResourceType::Speech),
            "music" => Ok(ResourceType::Music),
            other => Err(format!(
                "Unknown resource type '{}'. Valid: image, video, speech, music",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_parse() {
        assert_eq!("image".parse::<ResourceType>(), Ok(ResourceType::Image));
        assert_eq!("Videos".parse::<ResourceType>(), Ok(ResourceType::Video));
        assert_eq!("tts".parse::<ResourceType>(), Ok(ResourceType::Speech));
        assert!("hologram".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_resource_type_serialization() {
        let json = serde_json::to_string(&ResourceType::Music).unwrap();
        assert_eq!(json, "\"music\"");
        let parsed: ResourceType = serde_json::from_str("\"speech\"").unwrap();
        assert_eq!(parsed, ResourceType::Speech);
    }
}
