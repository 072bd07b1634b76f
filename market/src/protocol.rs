//! Live APY wire protocol
//!
//! Every push frame is a JSON object with a `type` discriminator and an
//! optional `data` payload:
//!
//! ```jsonc
//! { "type": "apy_update",   "data": { "asset": "XLM", "apy": "4.2", ... } }
//! { "type": "apy_update",   "data": [ { ... }, { ... } ] }
//! { "type": "error",        "data": { "message": "rate limited" } }
//! { "type": "subscribed",   "data": { "assets": ["XLM"] } }
//! { "type": "unsubscribed", "data": { "asset": "XLM" } }
//! ```
//!
//! Outbound frames always use the plural shape:
//!
//! ```jsonc
//! { "type": "subscribe",   "assets": ["XLM", "USDC"] }
//! { "type": "unsubscribe", "assets": ["XLM"] }
//! ```
//!
//! Numeric fields arrive as numbers or decimal strings and are coerced
//! leniently at this boundary (anything unparsable becomes `0.0`), so the
//! rest of the crate only ever sees finite `f64`s.
//!
//! Parsing rules:
//!
//! - invalid JSON returns an error
//! - a frame without `type` returns `None`
//! - unknown `type` values fall through to [`PushEvent::Unknown`]
//! - individual malformed items inside an `apy_update` batch are skipped

use chrono::DateTime;
use common::num::{de_lenient_f64, lenient_f64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FeedError;
use crate::types::HistoricalPoint;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RawFees {
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub swap: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub withdrawal: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RawRewards {
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub daily: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub weekly: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub monthly: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub yearly: f64,
}

/// One yield update as sent by either the push channel or the pull API.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RawUpdate {
    #[serde(default)]
    pub asset: String,

    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub apy: f64,

    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub tvl: f64,

    #[serde(rename = "volume24h", default, deserialize_with = "de_lenient_f64")]
    pub volume_24h: f64,

    #[serde(rename = "change24h", default, deserialize_with = "de_lenient_f64")]
    pub change_24h: f64,

    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub liquidity: f64,

    /// ISO-8601 string or epoch milliseconds.
    #[serde(rename = "lastUpdate", default)]
    pub last_update: Value,

    #[serde(default)]
    pub trend: Option<String>,

    #[serde(default)]
    pub risk: Option<String>,

    #[serde(default)]
    pub fees: Option<RawFees>,

    #[serde(default)]
    pub rewards: Option<RawRewards>,
}

impl RawUpdate {
    pub fn new(asset: impl Into<String>, apy: f64) -> Self {
        Self {
            asset: asset.into(),
            apy,
            ..Default::default()
        }
    }

    pub fn reported_at_ms(&self) -> Option<u64> {
        parse_timestamp_ms(&self.last_update)
    }
}

/// Typed view of one inbound push frame.
#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    Updates(Vec<RawUpdate>),
    ServerError(String),
    Subscribed(Vec<String>),
    Unsubscribed(Vec<String>),
    Unknown(Value),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Subscribe { assets: Vec<String> },
    Unsubscribe { assets: Vec<String> },
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, FeedError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn assets(&self) -> &[String] {
        match self {
            Self::Subscribe { assets } | Self::Unsubscribe { assets } => assets,
        }
    }
}

pub fn parse_push_message(raw: &str) -> Result<Option<PushEvent>, FeedError> {
    let env: Envelope = serde_json::from_str(raw)?;

    let Some(kind) = env.kind else {
        return Ok(None);
    };

    let event = match kind.as_str() {
        "apy_update" => PushEvent::Updates(parse_updates(env.data)),
        "error" => PushEvent::ServerError(error_message(&env.data)),
        "subscribed" => PushEvent::Subscribed(asset_list(&env.data)),
        "unsubscribed" => PushEvent::Unsubscribed(asset_list(&env.data)),
        _ => PushEvent::Unknown(env.data),
    };

    Ok(Some(event))
}

/// Decode a batch that may be a single object or an array of objects.
pub fn parse_updates(data: Value) -> Vec<RawUpdate> {
    let items = match data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawUpdate>(item) {
            Ok(u) if !u.asset.trim().is_empty() => Some(u),
            Ok(_) => {
                tracing::debug!("dropping update without asset");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed update");
                None
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawHistoricalPoint {
    #[serde(default)]
    timestamp: Value,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    apy: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    tvl: f64,
}

/// Decode the historical endpoint body, skipping points without a usable timestamp.
pub fn parse_history(data: Value) -> Vec<HistoricalPoint> {
    let Value::Array(items) = data else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawHistoricalPoint>(item).ok())
        .filter_map(|p| {
            Some(HistoricalPoint {
                timestamp_ms: parse_timestamp_ms(&p.timestamp)?,
                apy: p.apy,
                tvl: p.tvl,
            })
        })
        .collect()
}

/// Accepts epoch milliseconds (number or numeric string) or RFC 3339.
pub fn parse_timestamp_ms(v: &Value) -> Option<u64> {
    match v {
        Value::Number(_) => {
            let ms = lenient_f64(v);
            (ms > 0.0).then_some(ms as u64)
        }
        Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<u64>() {
                return Some(ms);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
        }
        _ => None,
    }
}

fn error_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
        Value::Null => "unspecified server error".to_string(),
        other => other.to_string(),
    }
}

fn asset_list(data: &Value) -> Vec<String> {
    let strings = |v: &Value| -> Vec<String> {
        v.as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };

    match data {
        Value::String(s) => vec![s.clone()],
        Value::Array(_) => strings(data),
        Value::Object(map) => {
            if let Some(assets) = map.get("assets") {
                strings(assets)
            } else {
                map.get("asset")
                    .and_then(Value::as_str)
                    .map(|s| vec![s.to_string()])
                    .unwrap_or_default()
            }
        }
        _ => Vec::new(),
    }
}
