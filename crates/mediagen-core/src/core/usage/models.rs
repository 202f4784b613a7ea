//! Usage Models
//!
//! Daily counters, limits and generation records persisted by the ledger.

use serde::{Deserialize, Serialize};

use crate::core::{RecordId, ResourceType};

/// Longest prompt excerpt kept on a record
pub const MAX_PROMPT_CHARS: usize = 100;

/// Share of a limit at which checks start warning
pub const WARNING_THRESHOLD_PERCENT: f64 = 80.0;

// =============================================================================
// Limit Types
// =============================================================================

/// A limited daily quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitType {
    Images,
    Videos,
    VideoSeconds,
    SpeechMinutes,
    MusicMinutes,
    TotalCost,
}

impl LimitType {
    pub fn all() -> [LimitType; 6] {
        [
            LimitType::Images,
            LimitType::Videos,
            LimitType::VideoSeconds,
            LimitType::SpeechMinutes,
            LimitType::MusicMinutes,
            LimitType::TotalCost,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Images => "images",
            LimitType::Videos => "videos",
            LimitType::VideoSeconds => "videoSeconds",
            LimitType::SpeechMinutes => "speechMinutes",
            LimitType::MusicMinutes => "musicMinutes",
            LimitType::TotalCost => "totalCost",
        }
    }

    /// Environment variable that configures this limit
    pub fn env_var(&self) -> &'static str {
        match self {
            LimitType::Images => "MEDIAGEN_LIMIT_IMAGES",
            LimitType::Videos => "MEDIAGEN_LIMIT_VIDEOS",
            LimitType::VideoSeconds => "MEDIAGEN_LIMIT_VIDEO_SECONDS",
            LimitType::SpeechMinutes => "MEDIAGEN_LIMIT_SPEECH_MINUTES",
            LimitType::MusicMinutes => "MEDIAGEN_LIMIT_MUSIC_MINUTES",
            LimitType::TotalCost => "MEDIAGEN_LIMIT_TOTAL_COST",
        }
    }

    /// Per-resource counters that gate a resource type. Total cost gates
    /// every type and is not listed.
    pub fn for_resource(resource: ResourceType) -> &'static [LimitType] {
        match resource {
            ResourceType::Image => &[LimitType::Images],
            ResourceType::Video => &[LimitType::Videos, LimitType::VideoSeconds],
            ResourceType::Speech => &[LimitType::SpeechMinutes],
            ResourceType::Music => &[LimitType::MusicMinutes],
        }
    }
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Limits & Counters
// =============================================================================

/// Optional daily ceilings. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DailyLimits {
    pub images: Option<f64>,
    pub videos: Option<f64>,
    pub video_seconds: Option<f64>,
    pub speech_minutes: Option<f64>,
    pub music_minutes: Option<f64>,
    pub total_cost: Option<f64>,
    /// Hour (UTC) at which a new usage day starts
    #[serde(rename = "resetHourUTC")]
    pub reset_hour_utc: u32,
}

impl DailyLimits {
    pub fn get(&self, limit_type: LimitType) -> Option<f64> {
        match limit_type {
            LimitType::Images => self.images,
            LimitType::Videos => self.videos,
            LimitType::VideoSeconds => self.video_seconds,
            LimitType::SpeechMinutes => self.speech_minutes,
            LimitType::MusicMinutes => self.music_minutes,
            LimitType::TotalCost => self.total_cost,
        }
    }

    pub fn set(&mut self, limit_type: LimitType, value: Option<f64>) {
        let slot = match limit_type {
            LimitType::Images => &mut self.images,
            LimitType::Videos => &mut self.videos,
            LimitType::VideoSeconds => &mut self.video_seconds,
            LimitType::SpeechMinutes => &mut self.speech_minutes,
            LimitType::MusicMinutes => &mut self.music_minutes,
            LimitType::TotalCost => &mut self.total_cost,
        };
        *slot = value;
    }

    pub fn with_limit(mut self, limit_type: LimitType, value: f64) -> Self {
        self.set(limit_type, Some(value));
        self
    }

    pub fn with_reset_hour(mut self, hour: u32) -> Self {
        self.reset_hour_utc = hour;
        self
    }
}

/// Per-day counters. Only non-cached generations move them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DailyCounters {
    pub images: u32,
    pub videos: u32,
    pub video_seconds: f64,
    pub speech_minutes: f64,
    pub music_minutes: f64,
    pub total_cost: f64,
    /// Generations whose cost could not be priced
    pub unpriced: u32,
}

impl DailyCounters {
    pub fn get(&self, limit_type: LimitType) -> f64 {
        match limit_type {
            LimitType::Images => f64::from(self.images),
            LimitType::Videos => f64::from(self.videos),
            LimitType::VideoSeconds => self.video_seconds,
            LimitType::SpeechMinutes => self.speech_minutes,
            LimitType::MusicMinutes => self.music_minutes,
            LimitType::TotalCost => self.total_cost,
        }
    }

    /// Adds a generation to the counters
    pub fn apply(&mut self, record: &GenerationRecord) {
        let seconds = record.duration_seconds.unwrap_or(0.0).max(0.0);
        match record.resource_type {
            ResourceType::Image => self.images = self.images.saturating_add(record.count),
            ResourceType::Video => {
                self.videos = self.videos.saturating_add(record.count);
                self.video_seconds += seconds;
            }
            ResourceType::Speech => self.speech_minutes += seconds / 60.0,
            ResourceType::Music => self.music_minutes += seconds / 60.0,
        }

        match record.estimated_cost {
            Some(cost) => self.total_cost += cost,
            None => self.unpriced = self.unpriced.saturating_add(1),
        }
    }
}

// =============================================================================
// Generation Records
// =============================================================================

/// Input to [`super::UsageLedger::record`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub provider: String,
    pub model_id: String,
    pub resource_type: ResourceType,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Total media duration for video, speech and music
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

fn default_count() -> u32 {
    1
}

impl UsageMetrics {
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            resource_type,
            count: 1,
            duration_seconds: None,
            cached: false,
            request_id: None,
            prompt: None,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// One completed generation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub id: RecordId,
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub provider: String,
    pub model_id: String,
    pub resource_type: ResourceType,
    /// `None` when pricing was unavailable
    pub estimated_cost: Option<f64>,
    pub cached: bool,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl GenerationRecord {
    /// Builds a record from metrics, truncating the prompt
    pub fn from_metrics(
        metrics: UsageMetrics,
        estimated_cost: Option<f64>,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            timestamp: timestamp.to_rfc3339(),
            provider: metrics.provider,
            model_id: metrics.model_id,
            resource_type: metrics.resource_type,
            estimated_cost,
            cached: metrics.cached,
            count: metrics.count,
            duration_seconds: metrics.duration_seconds,
            request_id: metrics.request_id,
            prompt: metrics
                .prompt
                .map(|p| p.chars().take(MAX_PROMPT_CHARS).collect()),
        }
    }
}

/// Usage of one partition day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsageState {
    /// `YYYY-MM-DD`, shifted by the reset hour
    pub date: String,
    #[serde(default)]
    pub counters: DailyCounters,
    #[serde(default)]
    pub generations: Vec<GenerationRecord>,
}

impl DailyUsageState {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            counters: DailyCounters::default(),
            generations: Vec::new(),
        }
    }
}

// =============================================================================
// Check Results
// =============================================================================

/// Outcome of a limit check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum LimitCheck {
    Allowed,
    /// Allowed, but at or above the warning threshold
    #[serde(rename_all = "camelCase")]
    Warning {
        limit_type: LimitType,
        percent: f64,
        current: f64,
        limit: f64,
    },
    #[serde(rename_all = "camelCase")]
    Blocked {
        limit_type: LimitType,
        current: f64,
        limit: f64,
    },
}

impl LimitCheck {
    pub fn is_allowed(&self) -> bool {
        !self.is_blocked()
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, LimitCheck::Blocked { .. })
    }
}

/// Result of recording a generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedUsage {
    pub record: GenerationRecord,
    /// Set the first time a provider could not be priced this session
    pub pricing_unavailable: Option<String>,
}
