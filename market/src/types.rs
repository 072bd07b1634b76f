use std::time::Duration;

use common::RiskLevel;
use serde::{Deserialize, Serialize};

/// Direction of a yield value relative to its previous observation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Stable,
}

impl Trend {
    /// Lenient parse for an upstream trend hint.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "stable" => Some(Self::Stable),
            _ => None,
        }
    }
}

/// Which channel produced a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Push,
    Poll,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Fees {
    pub swap: f64,
    pub withdrawal: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Rewards {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    pub yearly: f64,
}

/// Secondary numeric fields carried next to the yield value.
///
/// Every field is optional on the wire and defaults to zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SecondaryMetrics {
    pub tvl: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub liquidity: f64,
    pub fees: Fees,
    pub rewards: Rewards,
}

/// Current reconciled view of one subscribed key.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub key: String,

    /// Yield rate (APY, percent).
    pub value: f64,

    /// Value of the snapshot this one replaced, if any.
    pub previous_value: Option<f64>,

    pub metrics: SecondaryMetrics,
    pub trend: Trend,

    /// Supplied by the data source, never computed locally.
    pub risk: RiskLevel,

    /// Local receipt time (epoch ms).
    pub observed_at_ms: u64,

    /// The source's own `lastUpdate`, when it sent one.
    pub reported_at_ms: Option<u64>,

    pub source: Source,
}

impl MarketSnapshot {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.observed_at_ms)
    }

    /// Fresh means observed strictly less than `window_ms` ago.
    pub fn is_fresh(&self, now_ms: u64, window_ms: u64) -> bool {
        self.age_ms(now_ms) < window_ms
    }
}

/// Lifecycle of the push transport.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; stays here until an explicit `open()`.
    Degraded { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded { .. } => "degraded",
        }
    }
}

/// Share of snapshots that are recent enough to trust.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Excellent,
    Good,
    Fair,
    #[default]
    Poor,
}

/// Lookback windows accepted by the historical endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HistoryPeriod {
    OneHour,
    #[default]
    OneDay,
    SevenDays,
    ThirtyDays,
}

impl HistoryPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneHour => "1h",
            Self::OneDay => "24h",
            Self::SevenDays => "7d",
            Self::ThirtyDays => "30d",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1h" => Some(Self::OneHour),
            "24h" => Some(Self::OneDay),
            "7d" => Some(Self::SevenDays),
            "30d" => Some(Self::ThirtyDays),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoricalPoint {
    pub timestamp_ms: u64,
    pub apy: f64,
    pub tvl: f64,
}

/// Why polling took over from the push channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    /// Push channel is not connected.
    Disconnected,
    /// Connected, but `key` has not been refreshed for `age_ms`.
    Stale { key: String, age_ms: u64 },
}

/// Notifications fanned out to interested consumers.
///
/// State itself is read from the view; these only describe transitions.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    Opened,
    Disconnected { reason: String },
    ConnectFailed { attempt: u32, error: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
    FallbackActivated(FallbackReason),
    FallbackDeactivated,
    /// The server sent an explicit `error` frame.
    ServerError(String),
    /// Poll failure, non-2xx response or unparsable frame.
    UpstreamError(String),
}
