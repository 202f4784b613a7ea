//! Usage Ledger
//!
//! Records completed generations, keeps per-day counters and enforces the
//! configured daily limits.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{
    DailyLimits, DailyUsageState, GenerationRecord, LimitCheck, LimitType, PricingRegistry,
    RecordedUsage, UsageMetrics, UsageStore, DATE_FORMAT, WARNING_THRESHOLD_PERCENT,
};
use crate::core::{CoreError, CoreResult, ResourceType};

// =============================================================================
// Clock
// =============================================================================

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Partition date for `now`: UTC minus the reset hour, truncated to a day
pub fn get_today_date(now: DateTime<Utc>, reset_hour_utc: u32) -> String {
    let shifted = now - ChronoDuration::hours(i64::from(reset_hour_utc.min(23)));
    shifted.date_naive().format(DATE_FORMAT).to_string()
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug, Default)]
struct LedgerState {
    today: Option<DailyUsageState>,
    dirty: bool,
    /// Finished days whose flush failed; retried by `save`
    unflushed: Vec<DailyUsageState>,
    session: Vec<GenerationRecord>,
    unpriced_providers: HashSet<String>,
}

/// Daily usage ledger with limit enforcement
pub struct UsageLedger {
    store: UsageStore,
    limits: DailyLimits,
    tracking: bool,
    pricing: PricingRegistry,
    clock: Arc<dyn Clock>,
    state: RwLock<LedgerState>,
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLedger")
            .field("root", &self.store.root())
            .field("limits", &self.limits)
            .field("tracking", &self.tracking)
            .finish_non_exhaustive()
    }
}

impl UsageLedger {
    /// Creates a ledger storing daily documents under `root`
    pub fn new(root: impl Into<PathBuf>, limits: DailyLimits, pricing: PricingRegistry) -> Self {
        Self {
            store: UsageStore::new(root),
            limits,
            tracking: true,
            pricing,
            clock: Arc::new(SystemClock),
            state: RwLock::new(LedgerState::default()),
        }
    }

    /// Enables or disables daily tracking. Session records are kept either way.
    pub fn with_tracking(mut self, enabled: bool) -> Self {
        self.tracking = enabled;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn limits(&self) -> &DailyLimits {
        &self.limits
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn store(&self) -> &UsageStore {
        &self.store
    }

    fn current_date(&self) -> String {
        get_today_date(self.clock.now(), self.limits.reset_hour_utc)
    }

    /// Makes `state.today` the current partition, flushing the previous one.
    ///
    /// A failed flush keeps the finished day in memory for the next `save`.
    async fn ensure_today(&self, state: &mut LedgerState) {
        let date = self.current_date();
        if state.today.as_ref().is_some_and(|t| t.date == date) {
            return;
        }

        if let Some(previous) = state.today.take() {
            if state.dirty && self.tracking {
                info!("Usage day {} ended, flushing", previous.date);
                if let Err(e) = self.store.save(&previous).await {
                    warn!(
                        "Failed to flush usage for {}, will retry on next save: {}",
                        previous.date, e
                    );
                    state.unflushed.push(previous);
                }
            }
            state.dirty = false;
        }

        let loaded = if self.tracking {
            match self.store.load(&date).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!("Starting fresh usage for {}: {}", date, e);
                    None
                }
            }
        } else {
            None
        };

        state.today = Some(loaded.unwrap_or_else(|| DailyUsageState::new(date)));
    }

    /// Expected cost of a generation; `None` when it cannot be priced
    pub async fn estimate_cost(&self, metrics: &UsageMetrics) -> Option<f64> {
        if metrics.cached {
            return Some(0.0);
        }
        self.pricing.estimate(metrics).await.ok()
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Records a completed generation.
    ///
    /// Cached generations cost nothing and never move daily counters. An
    /// unpriceable generation is recorded with an unknown cost. Recording
    /// never fails; persistence errors surface from [`Self::save`].
    pub async fn record(&self, metrics: UsageMetrics) -> RecordedUsage {
        let priced = if metrics.cached {
            Ok(0.0)
        } else {
            self.pricing.estimate(&metrics).await
        };

        let mut state = self.state.write().await;

        let (estimated_cost, pricing_unavailable) = match priced {
            Ok(cost) => (Some(cost), None),
            Err(e) => {
                let first = state.unpriced_providers.insert(metrics.provider.clone());
                if first {
                    warn!("Cost unknown for {}: {}", metrics.model_id, e);
                }
                (None, first.then(|| e.to_string()))
            }
        };

        let record = GenerationRecord::from_metrics(metrics, estimated_cost, self.clock.now());
        state.session.push(record.clone());

        if !record.cached && self.tracking {
            self.ensure_today(&mut state).await;
            if let Some(today) = state.today.as_mut() {
                today.counters.apply(&record);
                today.generations.push(record.clone());
            }
            state.dirty = true;
        }

        info!(
            "Recorded {} x{} on {} (cost {}, cached {})",
            record.resource_type,
            record.count,
            record.model_id,
            record
                .estimated_cost
                .map(|c| format!("${:.4}", c))
                .unwrap_or_else(|| "unknown".to_string()),
            record.cached
        );

        RecordedUsage {
            record,
            pricing_unavailable,
        }
    }

    /// Writes today's state if it changed, plus any finished day whose flush
    /// failed earlier. Returns whether anything was written.
    pub async fn save(&self) -> CoreResult<bool> {
        if !self.tracking {
            return Ok(false);
        }

        let mut state = self.state.write().await;
        let mut written = false;

        let mut still_unflushed = Vec::new();
        let mut first_error = None;
        for previous in std::mem::take(&mut state.unflushed) {
            match self.store.save(&previous).await {
                Ok(()) => written = true,
                Err(e) => {
                    first_error.get_or_insert(e);
                    still_unflushed.push(previous);
                }
            }
        }
        state.unflushed = still_unflushed;

        if state.dirty {
            if let Some(today) = state.today.as_ref() {
                if let Err(e) = self.store.save(today).await {
                    return Err(first_error.unwrap_or(e));
                }
            }
            state.dirty = false;
            written = true;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    // =========================================================================
    // Limits
    // =========================================================================

    /// Checks the limits that gate `resource`
    pub async fn check_limits(&self, resource: ResourceType) -> CoreResult<LimitCheck> {
        self.check_limits_with_cost(resource, 0.0).await
    }

    /// Checks limits counting `estimated_cost` against the total cost limit
    pub async fn check_limits_with_cost(
        &self,
        resource: ResourceType,
        estimated_cost: f64,
    ) -> CoreResult<LimitCheck> {
        if !self.tracking {
            return Ok(LimitCheck::Allowed);
        }

        let mut state = self.state.write().await;
        self.ensure_today(&mut state).await;
        let counters = state
            .today
            .as_ref()
            .map(|t| t.counters.clone())
            .unwrap_or_default();
        drop(state);

        let mut warning: Option<LimitCheck> = None;
        let gated = LimitType::for_resource(resource)
            .iter()
            .copied()
            .chain(std::iter::once(LimitType::TotalCost));

        for limit_type in gated {
            let Some(limit) = self.limits.get(limit_type) else {
                continue;
            };

            let current = counters.get(limit_type);
            let projected = if limit_type == LimitType::TotalCost {
                current + estimated_cost.max(0.0)
            } else {
                current
            };

            if limit <= 0.0 || projected >= limit {
                warn!(
                    "Daily {} limit reached for {} ({} of {})",
                    limit_type, resource, projected, limit
                );
                return Ok(LimitCheck::Blocked {
                    limit_type,
                    current,
                    limit,
                });
            }

            let exact_percent = projected * 100.0 / limit;
            if exact_percent >= WARNING_THRESHOLD_PERCENT {
                let percent = (exact_percent * 10.0).round() / 10.0;
                let higher = match &warning {
                    Some(LimitCheck::Warning { percent: p, .. }) => percent > *p,
                    _ => true,
                };
                if higher {
                    warning = Some(LimitCheck::Warning {
                        limit_type,
                        percent,
                        current,
                        limit,
                    });
                }
            }
        }

        if let Some(LimitCheck::Warning {
            limit_type,
            percent,
            ..
        }) = &warning
        {
            warn!("Daily {} usage at {}% of limit", limit_type, percent);
        }

        Ok(warning.unwrap_or(LimitCheck::Allowed))
    }

    /// Like [`Self::check_limits`] but fails when blocked
    pub async fn assert_limits(&self, resource: ResourceType) -> CoreResult<LimitCheck> {
        self.assert_limits_with_cost(resource, 0.0).await
    }

    pub async fn assert_limits_with_cost(
        &self,
        resource: ResourceType,
        estimated_cost: f64,
    ) -> CoreResult<LimitCheck> {
        match self.check_limits_with_cost(resource, estimated_cost).await? {
            LimitCheck::Blocked {
                limit_type,
                current,
                limit,
            } => Err(CoreError::UsageLimitExceeded {
                limit_type,
                current,
                limit,
            }),
            check => Ok(check),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of the current partition
    pub async fn today(&self) -> CoreResult<DailyUsageState> {
        if !self.tracking {
            return Ok(DailyUsageState::new(self.current_date()));
        }

        let mut state = self.state.write().await;
        self.ensure_today(&mut state).await;
        Ok(state
            .today
            .clone()
            .unwrap_or_else(|| DailyUsageState::new(self.current_date())))
    }

    /// Every record made through this instance, cached ones included
    pub async fn session_records(&self) -> Vec<GenerationRecord> {
        self.state.read().await.session.clone()
    }

    /// Sum of known costs recorded through this instance
    pub async fn session_total_cost(&self) -> f64 {
        self.state
            .read()
            .await
            .session
            .iter()
            .filter_map(|r| r.estimated_cost)
            .sum()
    }

    /// Saved days, newest first, at most `days` of them. Today's unsaved
    /// changes are included.
    pub async fn history(&self, days: usize) -> CoreResult<Vec<DailyUsageState>> {
        let today = self.today().await?;
        let unflushed = self.state.read().await.unflushed.clone();

        let mut dates = self.store.list_dates().await?;
        for date in std::iter::once(&today.date).chain(unflushed.iter().map(|d| &d.date)) {
            if !dates.contains(date) {
                dates.push(date.clone());
            }
        }
        dates.sort();

        let mut history = Vec::new();
        for date in dates.into_iter().rev().take(days) {
            if date == today.date {
                history.push(today.clone());
            } else if let Some(pending) = unflushed.iter().find(|d| d.date == date) {
                history.push(pending.clone());
            } else if let Some(state) = self.store.load(&date).await? {
                history.push(state);
            }
        }
        Ok(history)
    }
}
