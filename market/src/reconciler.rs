//! Data Reconciler
//!
//! Owns the canonical per-key snapshot map and folds every incoming update
//! into it, regardless of whether it came from the push channel or a poll.
//!
//! ## Ordering
//! Updates are applied strictly in arrival order. The newest arrival always
//! replaces the stored snapshot, even when it carries an older `lastUpdate`
//! or comes from the slower channel. Callers (the feed driver) guarantee a
//! single writer.
//!
//! ## Trend
//!
//! ```text
//! delta = value_now - value_prev
//! |delta| <  epsilon  -> stable
//!  delta >= epsilon   -> up
//!  delta <= -epsilon  -> down
//! ```
//!
//! With no previous snapshot the source's own hint is used, else `stable`.
//!
//! ## Quality
//!
//! ```text
//! fresh_ratio = |{ s : now - s.observed_at < window }| / |snapshots|
//! >= 0.9 excellent, >= 0.7 good, >= 0.5 fair, else poor (empty -> poor)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use common::RiskLevel;

use crate::protocol::RawUpdate;
use crate::types::{DataQuality, Fees, MarketSnapshot, Rewards, SecondaryMetrics, Source, Trend};

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Minimum absolute change that counts as movement.
    pub trend_epsilon: f64,

    /// Snapshots observed within this window count as fresh.
    pub freshness_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            trend_epsilon: 0.01,
            freshness_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    config: ReconcilerConfig,
    snapshots: BTreeMap<String, MarketSnapshot>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            snapshots: BTreeMap::new(),
        }
    }

    /// Replace the snapshot for `update.asset` with one built from `update`.
    pub fn merge(&mut self, update: &RawUpdate, source: Source, now_ms: u64) -> &MarketSnapshot {
        let key = update.asset.trim().to_string();
        let previous_value = self.snapshots.get(&key).map(|s| s.value);
        let hint = update.trend.as_deref().and_then(Trend::parse);

        let snapshot = MarketSnapshot {
            key: key.clone(),
            value: update.apy,
            previous_value,
            metrics: metrics_from(update),
            trend: derive_trend(previous_value, update.apy, self.config.trend_epsilon, hint),
            risk: update
                .risk
                .as_deref()
                .and_then(RiskLevel::parse)
                .unwrap_or_default(),
            observed_at_ms: now_ms,
            reported_at_ms: update.reported_at_ms(),
            source,
        };

        tracing::trace!(key = %key, value = snapshot.value, ?source, "snapshot merged");

        self.snapshots.insert(key.clone(), snapshot);
        &self.snapshots[&key]
    }

    pub fn remove<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for k in keys {
            self.snapshots.remove(k.as_ref());
        }
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn get(&self, key: &str) -> Option<&MarketSnapshot> {
        self.snapshots.get(key)
    }

    pub fn snapshots(&self) -> &BTreeMap<String, MarketSnapshot> {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn quality(&self, now_ms: u64) -> DataQuality {
        let window_ms = self.config.freshness_window.as_millis() as u64;
        let fresh = self
            .snapshots
            .values()
            .filter(|s| s.is_fresh(now_ms, window_ms))
            .count();
        classify_quality(fresh, self.snapshots.len())
    }
}

pub fn derive_trend(previous: Option<f64>, current: f64, epsilon: f64, hint: Option<Trend>) -> Trend {
    let Some(prev) = previous else {
        return hint.unwrap_or_default();
    };

    let delta = current - prev;
    if delta.abs() < epsilon {
        Trend::Stable
    } else if delta > 0.0 {
        Trend::Up
    } else {
        Trend::Down
    }
}

/// Integer thresholds so that exact ratios (9/10, 7/10) land on the boundary.
pub fn classify_quality(fresh: usize, total: usize) -> DataQuality {
    if total == 0 {
        return DataQuality::Poor;
    }

    let scaled = fresh * 10;
    if scaled >= total * 9 {
        DataQuality::Excellent
    } else if scaled >= total * 7 {
        DataQuality::Good
    } else if scaled >= total * 5 {
        DataQuality::Fair
    } else {
        DataQuality::Poor
    }
}

fn metrics_from(u: &RawUpdate) -> SecondaryMetrics {
    let fees = u
        .fees
        .as_ref()
        .map(|f| Fees {
            swap: f.swap,
            withdrawal: f.withdrawal,
        })
        .unwrap_or_default();

    let rewards = u
        .rewards
        .as_ref()
        .map(|r| Rewards {
            daily: r.daily,
            weekly: r.weekly,
            monthly: r.monthly,
            yearly: r.yearly,
        })
        .unwrap_or_default();

    SecondaryMetrics {
        tvl: u.tvl,
        volume_24h: u.volume_24h,
        change_24h: u.change_24h,
        liquidity: u.liquidity,
        fees,
        rewards,
    }
}
