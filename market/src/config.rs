use std::time::Duration;

use crate::reconciler::ReconcilerConfig;
use crate::transport::BackoffPolicy;

/// Tunables for one [`crate::client::LiveMarketClient`].
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Reconnect schedule and attempt budget for the push channel.
    pub backoff: BackoffPolicy,

    /// Interval between fallback polls while polling is active.
    pub poll_every: Duration,

    /// A subscribed key with no data for this long triggers the fallback
    /// even while connected.
    pub stale_after: Duration,

    /// How often the driver checks for stale keys.
    pub staleness_check_every: Duration,

    pub reconciler: ReconcilerConfig,

    /// Pull requests slower than this are flagged in the logs.
    pub slow_request: Duration,

    /// Capacity of the [`crate::types::FeedEvent`] broadcast channel.
    pub event_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            poll_every: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            staleness_check_every: Duration::from_secs(5),
            reconciler: ReconcilerConfig::default(),
            slow_request: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}
