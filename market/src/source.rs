use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::FeedError;
use crate::protocol::{RawUpdate, parse_history, parse_updates};
use crate::types::{HistoricalPoint, HistoryPeriod};

/// Pull side of the live feed: used by the polling fallback, on-demand
/// refreshes and historical lookups.
#[async_trait]
pub trait MarketDataSource: Send + Sync + 'static {
    async fn fetch_updates(&self, keys: &[String]) -> Result<Vec<RawUpdate>, FeedError>;

    async fn fetch_history(&self, key: &str, period: HistoryPeriod) -> Result<Vec<HistoricalPoint>, FeedError>;
}

#[derive(Clone)]
pub struct HttpMarketSource {
    http: Client,
    base_url: String,
}

impl HttpMarketSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FeedError> {
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

/// Bodies come either as a bare array or wrapped in `{ "data": [...] }`.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketSource {
    #[instrument(skip(self, keys), fields(key_count = keys.len()), level = "debug")]
    async fn fetch_updates(&self, keys: &[String]) -> Result<Vec<RawUpdate>, FeedError> {
        let url = format!("{}/apy", self.base_url);

        let mut req = self.http.get(&url);
        if !keys.is_empty() {
            req = req.query(&[("assets", keys.join(","))]);
        }

        let body: Value = req.send().await?.error_for_status()?.json().await?;
        let updates = parse_updates(unwrap_data(body));

        debug!(received = updates.len(), "apy snapshot fetched");
        Ok(updates)
    }

    #[instrument(skip(self, period), fields(period = period.as_str()), level = "debug")]
    async fn fetch_history(&self, key: &str, period: HistoryPeriod) -> Result<Vec<HistoricalPoint>, FeedError> {
        let url = format!("{}/apy/historical", self.base_url);

        let body: Value = self
            .http
            .get(&url)
            .query(&[("asset", key), ("period", period.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match unwrap_data(body) {
            data @ Value::Array(_) => Ok(parse_history(data)),
            other => Err(FeedError::Upstream(format!("unexpected historical body: {other}"))),
        }
    }
}
