use std::time::Duration;

use async_trait::async_trait;
use common::num::{de_lenient_f64, lenient_f64};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::RouteError;
use crate::types::{Hop, RouteOptions, RouteQuote, RouteRequest};

/// Upstream that prices a route for a validated request.
///
/// Returned quotes are unstamped; the coordinator sets their validity window.
#[async_trait]
pub trait QuoteSource: Send + Sync + 'static {
    async fn fetch_route(&self, request: &RouteRequest) -> Result<RouteQuote, RouteError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RouteBody<'a> {
    from_asset: &'a str,
    to_asset: &'a str,
    amount: String,
    options: &'a RouteOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHop {
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    pool: String,
    #[serde(default)]
    asset: String,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    fee: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    price_impact: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    liquidity: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRoute {
    #[serde(default)]
    path: Vec<RawHop>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    output_amount: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    price_impact: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    estimated_gas: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    execution_time: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    confidence: f64,
    #[serde(default)]
    block_number: Value,
    #[serde(default)]
    alternatives: Vec<RawRoute>,
}

impl RawRoute {
    fn into_quote(self, request: &RouteRequest, depth: usize) -> RouteQuote {
        let block = lenient_f64(&self.block_number);

        RouteQuote {
            input_key: request.input_key.clone(),
            output_key: request.output_key.clone(),
            input_amount: request.amount,
            output_amount: self.output_amount,
            price_impact_percent: self.price_impact,
            estimated_cost_units: self.estimated_gas,
            confidence_percent: self.confidence,
            execution_time_secs: self.execution_time,
            block_number: (block > 0.0).then_some(block as u64),
            path: self
                .path
                .into_iter()
                .map(|h| Hop {
                    protocol: h.protocol,
                    pool: h.pool,
                    asset: h.asset,
                    fee: h.fee,
                    price_impact: h.price_impact,
                    liquidity: h.liquidity,
                })
                .collect(),
            alternatives: if depth == 0 {
                self.alternatives
                    .into_iter()
                    .map(|a| a.into_quote(request, depth + 1))
                    .collect()
            } else {
                Vec::new()
            },
            computed_at_ms: 0,
            valid_until_ms: 0,
        }
    }
}

/// Decode a route response, accepting an optional `{ "data": ... }` wrapper.
pub fn parse_route(body: Value, request: &RouteRequest) -> Result<RouteQuote, RouteError> {
    let body = match body {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    };

    if !body.is_object() {
        return Err(RouteError::Upstream(format!("unexpected route body: {body}")));
    }

    let raw: RawRoute = serde_json::from_value(body)?;
    Ok(raw.into_quote(request, 0))
}

#[derive(Clone)]
pub struct HttpQuoteSource {
    http: Client,
    base_url: String,
}

impl HttpQuoteSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RouteError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    #[instrument(
        skip(self, request),
        fields(input = %request.input_key, output = %request.output_key),
        level = "debug"
    )]
    async fn fetch_route(&self, request: &RouteRequest) -> Result<RouteQuote, RouteError> {
        let url = format!("{}/route", self.base_url);
        let body = RouteBody {
            from_asset: &request.input_key,
            to_asset: &request.output_key,
            amount: request.amount.to_string(),
            options: &request.options,
        };

        let resp: Value = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let quote = parse_route(resp, request)?;
        debug!(
            output = quote.output_amount,
            impact_pct = quote.price_impact_percent,
            alternatives = quote.alternatives.len(),
            "route fetched"
        );

        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> RouteRequest {
        RouteRequest::validate("XLM", "USDC", "100", RouteOptions::default()).unwrap()
    }

    #[test]
    fn parses_route_with_nested_alternatives() {
        let body = json!({
            "data": {
                "path": [
                    { "protocol": "soroswap", "pool": "P1", "asset": "USDC", "fee": "0.003", "priceImpact": 0.4, "liquidity": "250000" }
                ],
                "outputAmount": "98.7",
                "priceImpact": 0.4,
                "estimatedGas": 150000,
                "executionTime": 5,
                "confidence": 92,
                "blockNumber": 123456,
                "alternatives": [
                    { "outputAmount": 97.0, "alternatives": [ { "outputAmount": 1.0 } ] }
                ]
            }
        });

        let q = parse_route(body, &request()).unwrap();

        assert_eq!(q.output_amount, 98.7);
        assert_eq!(q.input_amount, 100.0);
        assert_eq!(q.block_number, Some(123_456));
        assert_eq!(q.path[0].liquidity, 250_000.0);
        assert_eq!(q.path[0].fee, 0.003);
        assert_eq!(q.alternatives.len(), 1);
        assert!(q.alternatives[0].alternatives.is_empty());
        assert_eq!(q.alternatives[0].input_key, "XLM");
    }

    #[test]
    fn non_object_body_is_upstream_error() {
        assert!(matches!(
            parse_route(json!([1, 2]), &request()),
            Err(RouteError::Upstream(_))
        ));
    }

    #[test]
    fn request_body_shape() {
        let req = request();
        let body = RouteBody {
            from_asset: &req.input_key,
            to_asset: &req.output_key,
            amount: req.amount.to_string(),
            options: &req.options,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "fromAsset": "XLM",
                "toAsset": "USDC",
                "amount": "100",
                "options": { "slippageTolerancePercent": 1.0 }
            })
        );
    }
}
