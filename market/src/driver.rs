//! Live feed driver
//!
//! A single task owns every piece of mutable feed state: the transport, the
//! subscription registry, the reconciler, the fallback poller and all timers.
//! It multiplexes
//!
//! - commands from [`crate::client::LiveMarketClient`]
//! - frames from the open push connection
//! - results of spawned network work (handshakes, pulls)
//! - the reconnect deadline, the poll interval and the staleness check
//!
//! with one `tokio::select!`, so every mutation is applied in arrival order
//! and no locks are needed. After each step the full state is republished
//! through the [`MarketViewStore`].
//!
//! Handshakes and pulls run in a `JoinSet` and report back over an internal
//! channel. Results from a superseded handshake (after `close()` or a newer
//! attempt) are recognised by their generation number and dropped.

use std::sync::Arc;
use std::time::Duration;

use common::logger::warn_if_slow;
use common::time::MonotonicClock;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, instrument, warn};

use crate::config::FeedConfig;
use crate::errors::FeedError;
use crate::poller::{PollingFallback, poll_ticker};
use crate::protocol::{OutboundMessage, PushEvent, RawUpdate, parse_push_message};
use crate::reconciler::Reconciler;
use crate::registry::SubscriptionRegistry;
use crate::source::MarketDataSource;
use crate::store::{MarketState, MarketViewStore};
use crate::transport::{PushConnection, PushConnector};
use crate::types::{ConnectionState, FallbackReason, FeedEvent, Source};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum Command {
    Open,
    Close,
    Reconnect,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Refresh,
    Send(OutboundMessage),
    Shutdown,
}

enum Internal {
    Connected { generation: u64, conn: PushConnection },
    ConnectFailed { generation: u64, error: FeedError },
    Fetched { kind: FetchKind, result: Result<Vec<RawUpdate>, FeedError> },
}

#[derive(Clone, Copy, Debug)]
enum FetchKind {
    Fallback,
    Refresh,
}

pub(crate) struct FeedDriver<C, S> {
    config: FeedConfig,
    connector: Arc<C>,
    source: Arc<S>,
    clock: MonotonicClock,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    store: MarketViewStore,
    events: broadcast::Sender<FeedEvent>,
    tasks: JoinSet<()>,

    // transport
    connection: ConnectionState,
    conn: Option<PushConnection>,
    handshake: Option<AbortHandle>,
    generation: u64,
    failures: u32,
    reconnect_at: Option<Instant>,

    registry: SubscriptionRegistry,
    reconciler: Reconciler,

    // fallback
    fallback: PollingFallback,
    poll_ticker: Option<Interval>,
    poll_in_flight: bool,
    staleness_ticker: Interval,

    refreshes_in_flight: usize,
    last_update_ms: Option<u64>,
    error: Option<String>,
}

impl<C, S> FeedDriver<C, S>
where
    C: PushConnector,
    S: MarketDataSource,
{
    pub(crate) fn new(
        config: FeedConfig,
        connector: Arc<C>,
        source: Arc<S>,
        commands: mpsc::UnboundedReceiver<Command>,
        store: MarketViewStore,
        events: broadcast::Sender<FeedEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let mut staleness_ticker = interval(config.staleness_check_every.max(Duration::from_millis(1)));
        staleness_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            reconciler: Reconciler::new(config.reconciler.clone()),
            config,
            connector,
            source,
            clock: MonotonicClock::new(),
            commands,
            internal_tx,
            internal_rx,
            store,
            events,
            tasks: JoinSet::new(),
            connection: ConnectionState::Disconnected,
            conn: None,
            handshake: None,
            generation: 0,
            failures: 0,
            reconnect_at: None,
            registry: SubscriptionRegistry::new(),
            fallback: PollingFallback::new(),
            poll_ticker: None,
            poll_in_flight: false,
            staleness_ticker,
            refreshes_in_flight: 0,
            last_update_ms: None,
            error: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("live market driver started");
        self.publish();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(msg) = self.internal_rx.recv() => self.handle_internal(msg).await,
                frame = next_frame(&mut self.conn) => self.handle_frame(frame),
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt();
                }
                _ = next_tick(&mut self.poll_ticker) => self.start_fallback_poll(),
                _ = self.staleness_ticker.tick() => self.check_staleness(),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "background task panicked");
                        }
                    }
                }
            }
        }

        self.teardown().await;
        info!("live market driver stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        debug!(?cmd, "command received");

        match cmd {
            Command::Open => self.open(),
            Command::Close => self.close().await,
            Command::Reconnect => {
                self.close().await;
                self.open();
            }
            Command::Subscribe(keys) => self.subscribe(keys).await,
            Command::Unsubscribe(keys) => self.unsubscribe(keys).await,
            Command::Refresh => {
                let keys = self.registry.keys();
                self.spawn_fetch(FetchKind::Refresh, keys);
            }
            Command::Send(msg) => self.send(msg).await,
            Command::Shutdown => {}
        }

        self.publish();
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected { generation, conn } => self.on_connected(generation, conn).await,
            Internal::ConnectFailed { generation, error } => self.on_connect_failed(generation, error),
            Internal::Fetched { kind, result } => self.on_fetched(kind, result),
        }

        self.publish();
    }

    fn handle_frame(&mut self, frame: Option<Result<String, FeedError>>) {
        match frame {
            Some(Ok(raw)) => self.on_push(&raw),
            Some(Err(e)) => self.on_transport_lost(e.to_string()),
            None => self.on_transport_lost("push channel closed by peer".to_string()),
        }

        self.publish();
    }

    // ---- transport -------------------------------------------------------

    fn open(&mut self) {
        if matches!(self.connection, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!(state = self.connection.label(), "open ignored; transport already active");
            return;
        }

        self.failures = 0;
        self.reconnect_at = None;
        self.start_attempt();
    }

    #[instrument(skip(self), fields(attempt = self.failures + 1))]
    fn start_attempt(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.connection = ConnectionState::Connecting;
        debug!(generation, "opening push channel");

        let connector = Arc::clone(&self.connector);
        let tx = self.internal_tx.clone();
        let handle = self.tasks.spawn(async move {
            let msg = match connector.connect().await {
                Ok(conn) => Internal::Connected { generation, conn },
                Err(error) => Internal::ConnectFailed { generation, error },
            };
            let _ = tx.send(msg);
        });

        self.handshake = Some(handle);
        self.publish();
    }

    async fn on_connected(&mut self, generation: u64, conn: PushConnection) {
        if generation != self.generation || !matches!(self.connection, ConnectionState::Connecting) {
            debug!(generation, "discarding superseded connection");
            return;
        }

        self.handshake = None;
        self.conn = Some(conn);
        self.connection = ConnectionState::Connected;
        self.failures = 0;
        self.error = None;
        self.fallback.on_connected();

        info!("push channel connected");
        self.emit(FeedEvent::Opened);

        if let Some(replay) = self.registry.replay_message() {
            debug!(keys = replay.assets().len(), "replaying subscriptions");
            self.send(replay).await;
        }

        self.try_stand_down();
    }

    fn on_connect_failed(&mut self, generation: u64, error: FeedError) {
        if generation != self.generation {
            debug!(generation, "ignoring failure of superseded handshake");
            return;
        }

        self.handshake = None;
        self.failures += 1;
        let attempt = self.failures;

        warn!(attempt, error = %error, "push channel connect failed");
        self.error = Some(error.to_string());
        self.emit(FeedEvent::ConnectFailed {
            attempt,
            error: error.to_string(),
        });
        self.activate_fallback(FallbackReason::Disconnected);

        if self.config.backoff.exhausted(attempt) {
            warn!(attempts = attempt, "reconnect attempts exhausted; staying degraded until reopened");
            self.connection = ConnectionState::Degraded {
                reason: format!("gave up after {attempt} connection attempts: {error}"),
            };
            self.emit(FeedEvent::ReconnectExhausted { attempts: attempt });
        } else {
            self.connection = ConnectionState::Disconnected;
            self.schedule_reconnect();
        }
    }

    fn on_transport_lost(&mut self, reason: String) {
        if self.conn.take().is_none() {
            return;
        }

        warn!(reason = %reason, "push channel lost");
        self.connection = ConnectionState::Disconnected;
        self.failures = 0;
        self.error = Some(reason.clone());
        self.emit(FeedEvent::Disconnected { reason });
        self.activate_fallback(FallbackReason::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let retry = self.failures.max(1);
        let delay = self.config.backoff.delay_for(retry);
        self.reconnect_at = Some(Instant::now() + delay);

        info!(attempt = retry, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.emit(FeedEvent::ReconnectScheduled { attempt: retry, delay });
    }

    async fn close(&mut self) {
        if let Some(h) = self.handshake.take() {
            h.abort();
        }
        self.generation += 1;
        self.reconnect_at = None;
        self.failures = 0;

        let was_connected = self.connection.is_connected();
        if let Some(mut conn) = self.conn.take() {
            match tokio::time::timeout(CLOSE_GRACE, conn.sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "error while closing push channel"),
                Err(_) => debug!("push channel close timed out"),
            }
        }

        self.connection = ConnectionState::Disconnected;
        self.stop_fallback();

        if was_connected {
            info!("push channel closed");
            self.emit(FeedEvent::Disconnected {
                reason: "closed by client".to_string(),
            });
        }
    }

    /// Write one outbound frame. Only warns when the channel is not open.
    pub(crate) async fn send(&mut self, msg: OutboundMessage) {
        if !self.connection.is_connected() {
            warn!(outbound = ?msg, "push channel not connected; outbound message dropped");
            return;
        }
        let Some(conn) = self.conn.as_mut() else {
            warn!(outbound = ?msg, "push channel not connected; outbound message dropped");
            return;
        };

        let text = match msg.to_json() {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to encode outbound message");
                return;
            }
        };

        debug!(payload = %text, "sending push message");
        if let Err(e) = conn.sink.send(text).await {
            self.on_transport_lost(format!("send failed: {e}"));
        }
    }

    // ---- subscriptions & data -------------------------------------------

    async fn subscribe(&mut self, keys: Vec<String>) {
        let added = self.registry.subscribe(&keys, self.clock.now_ms());

        if !added.is_empty() {
            info!(keys = ?added, "subscribed");
            if self.connection.is_connected() {
                self.send(OutboundMessage::Subscribe { assets: added }).await;
            }
        }

        let mut wanted: Vec<String> = keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| self.registry.contains(k))
            .map(str::to_string)
            .collect();
        wanted.sort();
        wanted.dedup();
        self.spawn_fetch(FetchKind::Refresh, wanted);
    }

    async fn unsubscribe(&mut self, keys: Vec<String>) {
        let removed = self.registry.unsubscribe(&keys);
        if removed.is_empty() {
            return;
        }

        info!(keys = ?removed, "unsubscribed");
        self.reconciler.remove(&removed);
        self.fallback.forget(&removed);

        if self.connection.is_connected() {
            self.send(OutboundMessage::Unsubscribe { assets: removed }).await;
        }

        self.try_stand_down();
    }

    fn on_push(&mut self, raw: &str) {
        tracing::trace!(raw_event = %raw, "push frame received");

        match parse_push_message(raw) {
            Ok(Some(PushEvent::Updates(updates))) => self.apply_updates(&updates, Source::Push),
            Ok(Some(PushEvent::ServerError(msg))) => {
                warn!(error = %msg, "server reported an error");
                self.error = Some(msg.clone());
                self.emit(FeedEvent::ServerError(msg));
            }
            Ok(Some(PushEvent::Subscribed(keys))) => debug!(?keys, "subscription acknowledged"),
            Ok(Some(PushEvent::Unsubscribed(keys))) => debug!(?keys, "unsubscription acknowledged"),
            Ok(Some(PushEvent::Unknown(data))) => debug!(%data, "ignoring unknown push event"),
            Ok(None) => debug!("ignoring push frame without type"),
            Err(e) => {
                warn!(error = %e, raw = %raw, "failed to parse push frame");
                self.emit(FeedEvent::UpstreamError(e.to_string()));
            }
        }
    }

    fn apply_updates(&mut self, updates: &[RawUpdate], source: Source) {
        let now = self.clock.now_ms();
        let mut merged = 0usize;

        for u in updates {
            let key = u.asset.trim();
            if !self.registry.contains(key) {
                debug!(key, "ignoring update for unsubscribed key");
                continue;
            }

            self.reconciler.merge(u, source, now);
            if source == Source::Push {
                self.fallback.record_push(key);
            }
            merged += 1;
        }

        if merged > 0 {
            self.last_update_ms = Some(now);
            self.error = None;
        }

        if source == Source::Push {
            self.try_stand_down();
        }
    }

    // ---- fallback polling -----------------------------------------------

    fn activate_fallback(&mut self, reason: FallbackReason) {
        if !self.fallback.activate(reason.clone()) {
            return;
        }

        info!(
            ?reason,
            every_ms = self.config.poll_every.as_millis() as u64,
            "polling fallback activated"
        );
        self.poll_ticker = Some(poll_ticker(self.config.poll_every.max(Duration::from_millis(1))));
        self.emit(FeedEvent::FallbackActivated(reason));
    }

    fn stop_fallback(&mut self) {
        let was_active = self.fallback.is_active();
        self.fallback.deactivate();
        self.poll_ticker = None;

        if was_active {
            info!("polling fallback deactivated");
            self.emit(FeedEvent::FallbackDeactivated);
        }
    }

    fn try_stand_down(&mut self) {
        if self
            .fallback
            .ready_to_stand_down(self.connection.is_connected(), &self.registry)
        {
            debug!("every subscribed key pushed since reconnect");
            self.stop_fallback();
        }
    }

    fn check_staleness(&mut self) {
        let now = self.clock.now_ms();

        if self.connection.is_connected() && !self.fallback.is_active() {
            let stale = PollingFallback::find_stale(&self.registry, &self.reconciler, self.config.stale_after, now);
            if let Some((key, age_ms)) = stale {
                warn!(key = %key, age_ms, "subscribed key went stale; falling back to polling");
                self.activate_fallback(FallbackReason::Stale { key, age_ms });
                self.publish();
                return;
            }
        }

        // quality decays with time alone
        if self.store.current().quality != self.reconciler.quality(now) {
            self.publish();
        }
    }

    fn start_fallback_poll(&mut self) {
        if self.poll_in_flight {
            debug!("previous poll still in flight; skipping tick");
            return;
        }

        let keys = self.registry.keys();
        if keys.is_empty() {
            return;
        }

        self.poll_in_flight = true;
        self.spawn_fetch(FetchKind::Fallback, keys);
    }

    fn spawn_fetch(&mut self, kind: FetchKind, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        if let FetchKind::Refresh = kind {
            self.refreshes_in_flight += 1;
        }

        let source = Arc::clone(&self.source);
        let tx = self.internal_tx.clone();
        let slow = self.config.slow_request;

        self.tasks.spawn(async move {
            let result = warn_if_slow("apy_fetch", slow, source.fetch_updates(&keys)).await;
            let _ = tx.send(Internal::Fetched { kind, result });
        });
    }

    fn on_fetched(&mut self, kind: FetchKind, result: Result<Vec<RawUpdate>, FeedError>) {
        match kind {
            FetchKind::Fallback => self.poll_in_flight = false,
            FetchKind::Refresh => self.refreshes_in_flight = self.refreshes_in_flight.saturating_sub(1),
        }

        match result {
            Ok(updates) => {
                debug!(?kind, received = updates.len(), "pull completed");
                self.apply_updates(&updates, Source::Poll);
            }
            Err(e) => {
                warn!(?kind, error = %e, "pull failed");
                self.error = Some(e.to_string());
                self.emit(FeedEvent::UpstreamError(e.to_string()));
            }
        }
    }

    // ---- publishing -------------------------------------------------------

    fn emit(&self, event: FeedEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let now = self.clock.now_ms();

        self.store.publish(MarketState {
            snapshots: Arc::new(self.reconciler.snapshots().clone()),
            quality: self.reconciler.quality(now),
            connection: self.connection.clone(),
            fallback_active: self.fallback.is_active(),
            fallback_reason: self.fallback.reason().cloned(),
            loading: self.refreshes_in_flight > 0,
            last_update_ms: self.last_update_ms,
            error: self.error.clone(),
        });
    }

    async fn teardown(&mut self) {
        self.close().await;
        self.tasks.shutdown().await;

        self.reconciler.clear();
        self.poll_in_flight = false;
        self.refreshes_in_flight = 0;
        self.publish();
    }
}

async fn next_frame(conn: &mut Option<PushConnection>) -> Option<Result<String, FeedError>> {
    match conn {
        Some(c) => c.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tracing_test::traced_test;

    use crate::types::{HistoricalPoint, HistoryPeriod};

    struct NeverConnects;

    #[async_trait]
    impl PushConnector for NeverConnects {
        async fn connect(&self) -> Result<PushConnection, FeedError> {
            Err(FeedError::Connection("refused".into()))
        }
    }

    struct EmptySource;

    #[async_trait]
    impl MarketDataSource for EmptySource {
        async fn fetch_updates(&self, _keys: &[String]) -> Result<Vec<RawUpdate>, FeedError> {
            Ok(Vec::new())
        }

        async fn fetch_history(&self, _key: &str, _p: HistoryPeriod) -> Result<Vec<HistoricalPoint>, FeedError> {
            Ok(Vec::new())
        }
    }

    fn driver() -> (FeedDriver<NeverConnects, EmptySource>, crate::store::MarketView) {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (store, view) = MarketViewStore::channel();
        let (events, _) = broadcast::channel(8);
        let d = FeedDriver::new(
            FeedConfig::default(),
            Arc::new(NeverConnects),
            Arc::new(EmptySource),
            rx,
            store,
            events,
        );
        (d, view)
    }

    #[tokio::test]
    #[traced_test]
    async fn send_while_disconnected_only_warns() {
        let (mut d, view) = driver();

        d.send(OutboundMessage::Subscribe {
            assets: vec!["XLM".into()],
        })
        .await;

        assert!(logs_contain("push channel not connected"));
        assert_eq!(view.current().connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn updates_for_unsubscribed_keys_are_ignored() {
        let (mut d, _view) = driver();
        d.registry.subscribe(["XLM"], 0);

        d.apply_updates(&[RawUpdate::new("XLM", 1.0), RawUpdate::new("ETH", 2.0)], Source::Push);

        assert!(d.reconciler.get("XLM").is_some());
        assert!(d.reconciler.get("ETH").is_none());
        assert!(d.last_update_ms.is_some());
    }

    #[tokio::test]
    async fn open_is_ignored_while_connecting() {
        let (mut d, _view) = driver();

        d.open();
        let generation = d.generation;
        d.open();

        assert_eq!(d.generation, generation);
        assert_eq!(d.connection, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn failures_after_close_are_ignored() {
        let (mut d, _view) = driver();

        d.open();
        let stale = d.generation;
        d.close().await;
        d.on_connect_failed(stale, FeedError::Connection("late".into()));

        assert_eq!(d.failures, 0);
        assert!(d.reconnect_at.is_none());
        assert_eq!(d.connection, ConnectionState::Disconnected);
    }
}
