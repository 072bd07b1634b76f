//! Request Coordinator
//!
//! Runs route lookups on behalf of many callers and keeps their results
//! consistent:
//!
//! - **last caller wins** per `(input, output)` pair: a new request cancels
//!   the pending one, which resolves with [`RouteError::Cancelled`]
//! - a superseded result is never written anywhere; the commit step checks
//!   the request id under the pending-table lock
//! - successful results are scored, cached with a validity window and
//!   published as the current route
//!
//! A caller that drops its future (abort, timeout, an outer `select!`)
//! releases its pending entry through [`PendingGuard`], and `loading` always
//! mirrors whether the pending table is non-empty.
//!
//! Quotes older than their validity window are never handed out: both
//! [`RequestCoordinator::cached_route`] and the current route filter them.
//!
//! Cancellation is advisory. The losing fetch future is dropped, but an
//! upstream that already received the request may still answer it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::logger::{TraceId, warn_if_slow};
use common::time::MonotonicClock;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::RouteError;
use crate::scorer::RouteScorer;
use crate::source::QuoteSource;
use crate::types::{PairKey, RouteOptions, RouteRequest, RouteState, ScoredQuote};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How long a cached quote stays valid after it was computed.
    pub route_ttl: Duration,

    /// Fetches slower than this are flagged in the logs.
    pub slow_request: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            route_ttl: Duration::from_secs(60),
            slow_request: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    id: TraceId,
    token: CancellationToken,
    issued_at_ms: u64,
}

pub struct RequestCoordinator<S> {
    source: Arc<S>,
    scorer: RouteScorer,
    config: CoordinatorConfig,
    clock: MonotonicClock,

    pending: Mutex<HashMap<PairKey, PendingRequest>>,
    cache: Mutex<HashMap<PairKey, Arc<ScoredQuote>>>,
    last_request: Mutex<Option<RouteRequest>>,
    state: watch::Sender<RouteState>,
}

impl<S: QuoteSource> RequestCoordinator<S> {
    pub fn new(source: Arc<S>, scorer: RouteScorer, config: CoordinatorConfig) -> Self {
        let (state, _) = watch::channel(RouteState::default());

        Self {
            source,
            scorer,
            config,
            clock: MonotonicClock::new(),
            pending: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
            state,
        }
    }

    /// Validate, fetch, score and cache a route for `input -> output`.
    #[instrument(skip(self, options), fields(input = %input_key, output = %output_key, amount = %amount))]
    pub async fn find_route(
        &self,
        input_key: &str,
        output_key: &str,
        amount: &str,
        options: RouteOptions,
    ) -> Result<Arc<ScoredQuote>, RouteError> {
        let request = RouteRequest::validate(input_key, output_key, amount, options)?;
        self.execute(request).await
    }

    /// Re-run the last successful request with the same parameters.
    pub async fn refresh_route(&self) -> Result<Arc<ScoredQuote>, RouteError> {
        let last = self.last_request.lock().clone();
        match last {
            Some(request) => {
                debug!(input = %request.input_key, output = %request.output_key, "refreshing route");
                self.execute(request).await
            }
            None => Err(RouteError::InvalidParameters("no previous route request to refresh".into())),
        }
    }

    /// Cancel every outstanding request and forget all cached routes.
    pub fn clear_route(&self) {
        let mut pending = self.pending.lock();
        for (pair, p) in pending.drain() {
            debug!(input = %pair.input, output = %pair.output, id = %p.id, "cancelling route request");
            p.token.cancel();
        }
        self.cache.lock().clear();
        *self.last_request.lock() = None;
        drop(pending);

        self.state.send_replace(RouteState::default());
        info!("route state cleared");
    }

    /// Cached quote for the pair, unless it has gone stale.
    pub fn cached_route(&self, input_key: &str, output_key: &str) -> Option<Arc<ScoredQuote>> {
        let pair = PairKey::new(input_key.trim(), output_key.trim());
        let now = self.clock.now_ms();

        let mut cache = self.cache.lock();
        match cache.get(&pair) {
            Some(q) if !q.quote.is_stale(now) => Some(Arc::clone(q)),
            Some(_) => {
                debug!(input = %pair.input, output = %pair.output, "evicting stale route");
                cache.remove(&pair);
                None
            }
            None => None,
        }
    }

    /// The most recently published route, unless it has gone stale.
    pub fn current_route(&self) -> Option<Arc<ScoredQuote>> {
        self.state().current
    }

    /// Snapshot of the route state with a stale current route dropped.
    pub fn state(&self) -> RouteState {
        let mut state = self.state.borrow().clone();
        let now = self.clock.now_ms();
        if state.current.as_ref().is_some_and(|q| q.quote.is_stale(now)) {
            debug!("current route is stale; refresh before use");
            state.current = None;
        }
        state
    }

    /// Epoch milliseconds on the timebase used for `valid_until_ms`.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn watch(&self) -> watch::Receiver<RouteState> {
        self.state.subscribe()
    }

    async fn execute(&self, request: RouteRequest) -> Result<Arc<ScoredQuote>, RouteError> {
        let pair = request.pair();
        let id = TraceId::default();
        let token = CancellationToken::new();

        {
            let mut pending = self.pending.lock();
            let entry = PendingRequest {
                id: id.clone(),
                token: token.clone(),
                issued_at_ms: self.clock.now_ms(),
            };
            if let Some(prev) = pending.insert(pair.clone(), entry) {
                debug!(
                    superseded = %prev.id,
                    age_ms = self.clock.now_ms().saturating_sub(prev.issued_at_ms),
                    "cancelling superseded route request"
                );
                prev.token.cancel();
            }
        }
        self.state.send_modify(|s| s.loading = true);
        let _guard = PendingGuard {
            pending: &self.pending,
            state: &self.state,
            pair: pair.clone(),
            id: id.clone(),
        };

        let fetched = tokio::select! {
            _ = token.cancelled() => Err(RouteError::Cancelled),
            res = warn_if_slow("route_fetch", self.config.slow_request, self.source.fetch_route(&request)) => res,
        };

        let mut pending = self.pending.lock();
        let current = pending.get(&pair).is_some_and(|p| p.id == id);
        if !current || token.is_cancelled() {
            debug!(id = %id, "route result superseded; discarding");
            return Err(RouteError::Cancelled);
        }
        pending.remove(&pair);
        let still_loading = !pending.is_empty();

        let result = match fetched {
            Ok(mut quote) => {
                let now = self.clock.now_ms();
                quote.stamp(now, self.config.route_ttl.as_millis() as u64);
                let scored = Arc::new(self.scorer.evaluate(quote, &request.options));

                self.cache.lock().insert(pair, Arc::clone(&scored));
                *self.last_request.lock() = Some(request);

                info!(
                    id = %id,
                    output = scored.quote.output_amount,
                    score = scored.score,
                    risks = scored.risks.len(),
                    warning = scored.price_impact_warning,
                    "route updated"
                );

                let published = Arc::clone(&scored);
                self.state.send_modify(|s| {
                    s.current = Some(published);
                    s.loading = still_loading;
                    s.error = None;
                    s.last_updated_ms = Some(now);
                });
                Ok(scored)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "route lookup failed");
                let msg = e.to_string();
                self.state.send_modify(|s| {
                    s.loading = still_loading;
                    s.error = Some(msg);
                });
                Err(e)
            }
        };
        drop(pending);

        result
    }
}

/// Releases a request's pending entry however its future ends.
///
/// Only the entry carrying the same id is removed, so a newer request for
/// the pair is left alone.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<PairKey, PendingRequest>>,
    state: &'a watch::Sender<RouteState>,
    pair: PairKey,
    id: TraceId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.pair).is_some_and(|p| p.id == self.id) {
            debug!(id = %self.id, "route request dropped before completion");
            pending.remove(&self.pair);
        }
        let loading = !pending.is_empty();
        drop(pending);

        self.state.send_if_modified(|s| {
            let changed = s.loading != loading;
            s.loading = loading;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RouteQuote;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl QuoteSource for Echo {
        async fn fetch_route(&self, request: &RouteRequest) -> Result<RouteQuote, RouteError> {
            Ok(RouteQuote {
                input_key: request.input_key.clone(),
                output_key: request.output_key.clone(),
                input_amount: request.amount,
                output_amount: request.amount * 0.99,
                confidence_percent: 90.0,
                ..Default::default()
            })
        }
    }

    fn coordinator() -> RequestCoordinator<Echo> {
        RequestCoordinator::new(Arc::new(Echo), RouteScorer::default(), CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_source() {
        let c = coordinator();
        let err = c.find_route("XLM", "XLM", "10", RouteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RouteError::InvalidParameters(_)));
        assert!(c.current_route().is_none());
        assert!(c.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn success_is_cached_and_published() {
        let c = coordinator();
        let q = c.find_route("XLM", "USDC", "100", RouteOptions::default()).await.unwrap();

        assert!((q.minimum_received - 98.01).abs() < 1e-9);
        assert!(q.quote.valid_until_ms > q.quote.computed_at_ms);
        assert_eq!(c.cached_route("XLM", "USDC").map(|r| r.quote.output_amount), Some(99.0));

        let state = c.state();
        assert!(!state.loading);
        assert!(state.error.is_none());
        assert!(state.current.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires_after_ttl() {
        let c = coordinator();
        c.find_route("XLM", "USDC", "100", RouteOptions::default()).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(c.cached_route("XLM", "USDC").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(c.cached_route("XLM", "USDC").is_none());
    }

    #[tokio::test]
    async fn refresh_needs_a_previous_request() {
        let c = coordinator();
        assert!(matches!(c.refresh_route().await, Err(RouteError::InvalidParameters(_))));

        c.find_route("XLM", "USDC", "50", RouteOptions::default()).await.unwrap();
        let again = c.refresh_route().await.unwrap();
        assert_eq!(again.quote.input_amount, 50.0);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let c = coordinator();
        c.find_route("XLM", "USDC", "50", RouteOptions::default()).await.unwrap();

        c.clear_route();

        assert!(c.cached_route("XLM", "USDC").is_none());
        assert!(c.current_route().is_none());
        assert!(c.refresh_route().await.is_err());
    }
}
