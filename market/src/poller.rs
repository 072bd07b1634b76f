//! Polling Fallback
//!
//! Decides when the pull source has to stand in for the push channel.
//!
//! ## Activation
//! - the push channel is not connected, or
//! - while connected, some subscribed key has not been refreshed within the
//!   staleness threshold (measured from its last snapshot, or from its
//!   subscription time when no data has arrived yet).
//!
//! ## Deactivation
//! Only when connected **and** a push for every subscribed key has been
//! observed since the fallback was activated or the channel (re)connected.
//! A bare reconnect is not enough.
//!
//! This type only holds the decision state. The feed driver owns the timer
//! and issues the actual polls, at most one in flight.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, interval};

use crate::reconciler::Reconciler;
use crate::registry::SubscriptionRegistry;
use crate::types::FallbackReason;

#[derive(Debug, Default)]
pub struct PollingFallback {
    active: Option<FallbackReason>,
    /// Keys pushed since activation or the last (re)connect.
    confirmed: HashSet<String>,
}

impl PollingFallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call switched polling on.
    pub fn activate(&mut self, reason: FallbackReason) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(reason);
        self.confirmed.clear();
        true
    }

    pub fn deactivate(&mut self) {
        self.active = None;
        self.confirmed.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn reason(&self) -> Option<&FallbackReason> {
        self.active.as_ref()
    }

    pub fn on_connected(&mut self) {
        self.confirmed.clear();
    }

    pub fn record_push(&mut self, key: &str) {
        if self.active.is_some() {
            self.confirmed.insert(key.to_string());
        }
    }

    pub fn forget<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for k in keys {
            self.confirmed.remove(k.as_ref());
        }
    }

    pub fn ready_to_stand_down(&self, connected: bool, registry: &SubscriptionRegistry) -> bool {
        self.active.is_some() && connected && registry.iter().all(|(k, _)| self.confirmed.contains(k))
    }

    /// Oldest subscribed key whose data is older than `stale_after`.
    pub fn find_stale(
        registry: &SubscriptionRegistry,
        reconciler: &Reconciler,
        stale_after: Duration,
        now_ms: u64,
    ) -> Option<(String, u64)> {
        let limit_ms = stale_after.as_millis() as u64;

        registry
            .iter()
            .map(|(key, subscribed_at)| {
                let seen_at = reconciler
                    .get(key)
                    .map(|s| s.observed_at_ms)
                    .unwrap_or(subscribed_at);
                (key, now_ms.saturating_sub(seen_at))
            })
            .filter(|(_, age)| *age > limit_ms)
            .max_by_key(|(_, age)| *age)
            .map(|(k, age)| (k.to_string(), age))
    }
}

/// Poll timer: first tick fires immediately, missed ticks are skipped.
pub fn poll_ticker(every: Duration) -> Interval {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
