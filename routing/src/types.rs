use std::sync::Arc;

use common::RiskLevel;
use common::num::parse_positive_amount;
use serde::Serialize;

use crate::errors::RouteError;

/// One step of a swap path.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Hop {
    pub protocol: String,
    pub pool: String,
    pub asset: String,
    pub fee: f64,
    pub price_impact: f64,
    pub liquidity: f64,
}

/// A priced route for one input/output pair.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouteQuote {
    pub input_key: String,
    pub output_key: String,
    pub input_amount: f64,
    pub output_amount: f64,
    pub price_impact_percent: f64,
    pub estimated_cost_units: f64,
    pub confidence_percent: f64,
    pub execution_time_secs: f64,
    pub block_number: Option<u64>,
    pub path: Vec<Hop>,

    /// Never nested: alternatives carry no alternatives of their own.
    pub alternatives: Vec<RouteQuote>,

    pub computed_at_ms: u64,
    pub valid_until_ms: u64,
}

impl RouteQuote {
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms >= self.valid_until_ms
    }

    /// Smallest pool liquidity along the path.
    pub fn min_hop_liquidity(&self) -> Option<f64> {
        self.path.iter().map(|h| h.liquidity).reduce(f64::min)
    }

    /// Set `computed_at`/`valid_until` on this quote and its alternatives.
    pub fn stamp(&mut self, now_ms: u64, ttl_ms: u64) {
        let ttl_ms = ttl_ms.max(1);
        self.computed_at_ms = now_ms;
        self.valid_until_ms = now_ms + ttl_ms;
        for alt in &mut self.alternatives {
            alt.alternatives.clear();
            alt.computed_at_ms = now_ms;
            alt.valid_until_ms = now_ms + ttl_ms;
        }
    }
}

/// Caller preferences forwarded to the quote source.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptions {
    pub slippage_tolerance_percent: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hops: Option<u32>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            slippage_tolerance_percent: 1.0,
            max_hops: None,
            protocols: Vec::new(),
        }
    }
}

/// Identifies the pending/cached slot of a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub input: String,
    pub output: String,
}

impl PairKey {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

/// A validated route request.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteRequest {
    pub input_key: String,
    pub output_key: String,
    pub amount: f64,
    pub options: RouteOptions,
}

impl RouteRequest {
    pub fn validate(
        input_key: &str,
        output_key: &str,
        amount: &str,
        options: RouteOptions,
    ) -> Result<Self, RouteError> {
        let input_key = input_key.trim();
        let output_key = output_key.trim();

        if input_key.is_empty() || output_key.is_empty() {
            return Err(RouteError::InvalidParameters(
                "input and output assets are required".into(),
            ));
        }
        if input_key == output_key {
            return Err(RouteError::InvalidParameters(format!(
                "input and output asset are both {input_key}"
            )));
        }
        let Some(amount) = parse_positive_amount(amount) else {
            return Err(RouteError::InvalidParameters(format!(
                "amount {amount:?} is not a positive number"
            )));
        };
        if !options.slippage_tolerance_percent.is_finite() || options.slippage_tolerance_percent < 0.0 {
            return Err(RouteError::InvalidParameters(
                "slippage tolerance must be a non-negative number".into(),
            ));
        }

        Ok(Self {
            input_key: input_key.to_string(),
            output_key: output_key.to_string(),
            amount,
            options,
        })
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(self.input_key.clone(), self.output_key.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskKind {
    Liquidity,
    Slippage,
    Price,
    Gas,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskFinding {
    #[serde(rename = "type")]
    pub kind: RiskKind,
    pub level: RiskLevel,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredAlternative {
    pub quote: RouteQuote,
    pub score: f64,
}

/// A quote together with everything derived from it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredQuote {
    pub quote: RouteQuote,
    pub score: f64,
    pub risks: Vec<RiskFinding>,

    /// Impact exceeds the configured maximum. The quote is still returned.
    pub price_impact_warning: bool,

    /// `output * (1 - slippage / 100)`
    pub minimum_received: f64,

    /// Ranked best first.
    pub alternatives: Vec<ScoredAlternative>,
}

/// Published route state for rendering layers.
#[derive(Clone, Debug, Default)]
pub struct RouteState {
    pub current: Option<Arc<ScoredQuote>>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_bad_requests() {
        let ok = RouteRequest::validate("XLM", "USDC", "100", RouteOptions::default()).unwrap();
        assert_eq!(ok.amount, 100.0);
        assert_eq!(ok.pair(), PairKey::new("XLM", "USDC"));

        for (i, o, a) in [
            ("", "USDC", "1"),
            ("XLM", " ", "1"),
            ("XLM", "XLM", "1"),
            ("XLM", "USDC", "0"),
            ("XLM", "USDC", "-5"),
            ("XLM", "USDC", "lots"),
            ("XLM", "USDC", "NaN"),
        ] {
            let err = RouteRequest::validate(i, o, a, RouteOptions::default()).unwrap_err();
            assert!(matches!(err, RouteError::InvalidParameters(_)), "{i}/{o}/{a}");
        }
    }

    #[test]
    fn stamping_flattens_alternatives() {
        let mut q = RouteQuote {
            alternatives: vec![RouteQuote {
                alternatives: vec![RouteQuote::default()],
                ..Default::default()
            }],
            ..Default::default()
        };

        q.stamp(1_000, 60_000);

        assert_eq!(q.valid_until_ms, 61_000);
        assert!(q.valid_until_ms > q.computed_at_ms);
        assert!(q.alternatives[0].alternatives.is_empty());
        assert!(!q.is_stale(60_999));
        assert!(q.is_stale(61_000));
    }

    #[test]
    fn min_liquidity_over_path() {
        let q = RouteQuote {
            path: vec![
                Hop { liquidity: 80_000.0, ..Default::default() },
                Hop { liquidity: 12_000.0, ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(q.min_hop_liquidity(), Some(12_000.0));
        assert_eq!(RouteQuote::default().min_hop_liquidity(), None);
    }
}
