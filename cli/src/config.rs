use std::str::FromStr;
use std::time::Duration;

use market::{BackoffPolicy, FeedConfig};
use routing::{CoordinatorConfig, ScorerConfig};

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Push endpoint for live yield updates.
    pub ws_url: String,

    /// Base URL of the REST API (`/apy`, `/apy/historical`, `/route`).
    pub api_base_url: String,

    /// Interval between fallback polls while the push channel is unhealthy.
    pub poll_interval_ms: u64,

    /// A subscribed asset with no update for this long is considered stale
    /// and switches polling on even while connected.
    pub staleness_ms: u64,

    /// First reconnect delay; doubles on every consecutive failure.
    pub reconnect_base_ms: u64,

    /// Consecutive failed handshakes before the client reports `degraded`.
    pub reconnect_max_attempts: u32,

    /// Routes with a larger price impact are flagged, never dropped.
    pub max_price_impact_percent: f64,

    /// Validity window of a cached route.
    pub route_ttl_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            ws_url: env_or("WS_URL", "ws://localhost:3001/ws".to_string()),
            api_base_url: env_or("API_BASE_URL", "http://localhost:3000/api".to_string()),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", 30_000),
            staleness_ms: env_or("STALENESS_MS", 60_000),
            reconnect_base_ms: env_or("RECONNECT_BASE_MS", 2_000),
            reconnect_max_attempts: env_or("RECONNECT_MAX_ATTEMPTS", 5),
            max_price_impact_percent: env_or("MAX_PRICE_IMPACT_PERCENT", 15.0),
            route_ttl_ms: env_or("ROUTE_TTL_MS", 60_000),
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        let mut cfg = FeedConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_ms),
                max_attempts: self.reconnect_max_attempts,
                ..Default::default()
            },
            poll_every: Duration::from_millis(self.poll_interval_ms),
            stale_after: Duration::from_millis(self.staleness_ms),
            ..Default::default()
        };
        cfg.reconciler.freshness_window = cfg.stale_after;
        cfg
    }

    pub fn scorer_config(&self) -> ScorerConfig {
        ScorerConfig {
            max_price_impact_percent: self.max_price_impact_percent,
            ..Default::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            route_ttl: Duration::from_millis(self.route_ttl_ms),
            ..Default::default()
        }
    }
}

/// `APP_ENV=production`; read before tracing is up so the log format can follow it.
pub fn is_production() -> bool {
    std::env::var("APP_ENV").is_ok_and(|v| v == "production")
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            default
        }),
        Err(_) => default,
    }
}
