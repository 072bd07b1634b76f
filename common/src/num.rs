//! Lenient numeric coercion for loosely-typed upstream payloads.
//!
//! Upstream services send numbers either as JSON numbers or as decimal
//! strings, and occasionally omit them or send garbage. Everything that is
//! not a finite number coerces to `0.0`; nothing here ever fails.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Coerce a JSON value into a finite `f64`, defaulting to `0.0`.
pub fn lenient_f64(v: &Value) -> f64 {
    let n = match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };

    if n.is_finite() { n } else { 0.0 }
}

/// Serde adapter: `#[serde(default, deserialize_with = "common::num::de_lenient_f64")]`.
pub fn de_lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(lenient_f64(&v))
}

/// Parse a user-supplied amount. Returns `None` unless it is finite and > 0.
pub fn parse_positive_amount(raw: &str) -> Option<f64> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Some(v),
        _ => None,
    }
}
