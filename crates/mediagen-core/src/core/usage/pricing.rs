//! Provider Pricing
//!
//! One [`PriceLookup`] per provider, selected by name through a
//! [`PricingRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::UsageMetrics;
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Prices
// =============================================================================

/// Billing unit of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PriceUnit {
    PerImage,
    PerSecond,
    PerMinute,
    PerRequest,
}

/// Price in USD per unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPrice {
    pub amount: f64,
    pub unit: PriceUnit,
}

impl UnitPrice {
    pub const fn new(amount: f64, unit: PriceUnit) -> Self {
        Self { amount, unit }
    }
}

/// Cost of `metrics` at `price`. Duration-billed units need a duration.
pub fn cost_for(provider: &str, price: &UnitPrice, metrics: &UsageMetrics) -> CoreResult<f64> {
    let duration = || {
        metrics.duration_seconds.ok_or_else(|| CoreError::PricingUnavailable {
            provider: provider.to_string(),
            reason: format!("{} is billed by duration but none was reported", metrics.model_id),
        })
    };

    let cost = match price.unit {
        PriceUnit::PerImage => price.amount * f64::from(metrics.count),
        PriceUnit::PerSecond => price.amount * duration()?,
        PriceUnit::PerMinute => price.amount * duration()? / 60.0,
        PriceUnit::PerRequest => price.amount,
    };
    Ok(cost.max(0.0))
}

// =============================================================================
// Lookup Trait
// =============================================================================

/// Per-provider price source
#[async_trait]
pub trait PriceLookup: Send + Sync {
    /// Provider name used as the registry key
    fn provider(&self) -> &str;

    /// Price of a model; fails with [`CoreError::PricingUnavailable`]
    async fn get_price(&self, model_id: &str) -> CoreResult<UnitPrice>;

    /// Cost of a generation at a given price
    fn calculate_cost(&self, price: &UnitPrice, metrics: &UsageMetrics) -> CoreResult<f64> {
        cost_for(self.provider(), price, metrics)
    }
}

// =============================================================================
// Static Price Table
// =============================================================================

/// In-memory table with exact and prefix model matching
#[derive(Debug, Clone)]
pub struct StaticPriceTable {
    provider: String,
    prices: HashMap<String, UnitPrice>,
}

impl StaticPriceTable {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            prices: HashMap::new(),
        }
    }

    pub fn with_price(mut self, model_id: impl Into<String>, price: UnitPrice) -> Self {
        self.prices.insert(model_id.into(), price);
        self
    }

    /// Default table for the fal.ai queue (USD, early 2026)
    pub fn builtin_fal() -> Self {
        use PriceUnit::*;

        Self::new("fal")
            // Images
            .with_price("fal-ai/flux/schnell", UnitPrice::new(0.003, PerImage))
            .with_price("fal-ai/flux/dev", UnitPrice::new(0.025, PerImage))
            .with_price("fal-ai/flux-pro", UnitPrice::new(0.05, PerImage))
            .with_price("fal-ai/recraft-v3", UnitPrice::new(0.04, PerImage))
            .with_price("fal-ai/ideogram/v2", UnitPrice::new(0.08, PerImage))
            // Video
            .with_price("fal-ai/kling-video", UnitPrice::new(0.07, PerSecond))
            .with_price("fal-ai/minimax/video-01", UnitPrice::new(0.5, PerRequest))
            .with_price("fal-ai/luma-dream-machine", UnitPrice::new(0.5, PerRequest))
            // Audio
            .with_price("fal-ai/elevenlabs/tts", UnitPrice::new(0.1, PerMinute))
            .with_price("fal-ai/stable-audio", UnitPrice::new(0.02, PerRequest))
    }

    /// Exact match first, then the longest registered prefix
    pub fn lookup(&self, model_id: &str) -> Option<UnitPrice> {
        if let Some(price) = self.prices.get(model_id) {
            return Some(*price);
        }

        self.prices
            .iter()
            .filter(|(m, _)| model_id.starts_with(m.as_str()))
            .max_by_key(|(m, _)| m.len())
            .map(|(_, price)| *price)
    }
}

#[async_trait]
impl PriceLookup for StaticPriceTable {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn get_price(&self, model_id: &str) -> CoreResult<UnitPrice> {
        self.lookup(model_id)
            .ok_or_else(|| CoreError::PricingUnavailable {
                provider: self.provider.clone(),
                reason: format!("no price for model '{}'", model_id),
            })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Name-keyed set of price lookups
#[derive(Clone, Default)]
pub struct PricingRegistry {
    lookups: HashMap<String, Arc<dyn PriceLookup>>,
}

impl std::fmt::Debug for PricingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<&String> = self.lookups.keys().collect();
        providers.sort();
        f.debug_struct("PricingRegistry")
            .field("providers", &providers)
            .finish()
    }
}

impl PricingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tables
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StaticPriceTable::builtin_fal()));
        registry
    }

    /// Registers a lookup under its provider name, replacing any previous one
    pub fn register(&mut self, lookup: Arc<dyn PriceLookup>) {
        self.lookups.insert(lookup.provider().to_string(), lookup);
    }

    pub fn get(&self, provider: &str) -> CoreResult<Arc<dyn PriceLookup>> {
        self.lookups
            .get(provider)
            .cloned()
            .ok_or_else(|| CoreError::PricingUnavailable {
                provider: provider.to_string(),
                reason: "no price lookup registered".to_string(),
            })
    }

    /// Prices a generation through its provider's lookup
    pub async fn estimate(&self, metrics: &UsageMetrics) -> CoreResult<f64> {
        let lookup = self.get(&metrics.provider)?;
        let price = lookup.get_price(&metrics.model_id).await?;
        lookup.calculate_cost(&price, metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResourceType;

    #[test]
    fn test_exact_and_prefix_match() {
        let table = StaticPriceTable::new("fal")
            .with_price("fal-ai/flux", UnitPrice::new(0.02, PriceUnit::PerImage))
            .with_price("fal-ai/flux/dev", UnitPrice::new(0.025, PriceUnit::PerImage));

        assert_eq!(table.lookup("fal-ai/flux/dev").unwrap().amount, 0.025);
        // Longest prefix wins
        assert_eq!(table.lookup("fal-ai/flux/dev/image-to-image").unwrap().amount, 0.025);
        assert_eq!(table.lookup("fal-ai/flux/schnell").unwrap().amount, 0.02);
        assert!(table.lookup("fal-ai/other").is_none());
    }

    #[test]
    fn test_cost_units() {
        let image = UsageMetrics::new("fal", "m", ResourceType::Image).with_count(4);
        assert_eq!(
            cost_for("fal", &UnitPrice::new(0.25, PriceUnit::PerImage), &image).unwrap(),
            1.0
        );

        let video = UsageMetrics::new("fal", "m", ResourceType::Video).with_duration(5.0);
        assert_eq!(
            cost_for("fal", &UnitPrice::new(0.1, PriceUnit::PerSecond), &video).unwrap(),
            0.5
        );

        let speech = UsageMetrics::new("fal", "m", ResourceType::Speech).with_duration(30.0);
        assert_eq!(
            cost_for("fal", &UnitPrice::new(0.2, PriceUnit::PerMinute), &speech).unwrap(),
            0.1
        );

        let no_duration = UsageMetrics::new("fal", "m", ResourceType::Video);
        assert!(matches!(
            cost_for("fal", &UnitPrice::new(0.1, PriceUnit::PerSecond), &no_duration),
            Err(CoreError::PricingUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_registry_estimate() {
        let registry = PricingRegistry::with_builtin();

        let flux = UsageMetrics::new("fal", "fal-ai/flux/dev", ResourceType::Image).with_count(2);
        assert_eq!(registry.estimate(&flux).await.unwrap(), 0.05);

        let unknown_model = UsageMetrics::new("fal", "fal-ai/mystery", ResourceType::Image);
        assert!(registry.estimate(&unknown_model).await.is_err());

        let unknown_provider = UsageMetrics::new("replicate", "x", ResourceType::Image);
        match registry.estimate(&unknown_provider).await {
            Err(CoreError::PricingUnavailable { provider, .. }) => assert_eq!(provider, "replicate"),
            other => panic!("Expected PricingUnavailable, got {:?}", other),
        }
    }
}
