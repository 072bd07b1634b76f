use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{Value, json};

use market::protocol::RawUpdate;
use market::types::{ConnectionState, FallbackReason, FeedEvent, HistoricalPoint, HistoryPeriod, Source};
use market::{FeedConfig, FeedError, LiveMarketClient, MarketDataSource, PushConnection, PushConnector};

// ---------------------------------------------------------------------------
// mocks
// ---------------------------------------------------------------------------

/// Hands out pre-built connections in order, then refuses.
#[derive(Default)]
struct ScriptedConnector {
    attempts: AtomicUsize,
    script: Mutex<VecDeque<PushConnection>>,
}

impl ScriptedConnector {
    fn failing() -> Self {
        Self::default()
    }

    fn with(conns: Vec<PushConnection>) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            script: Mutex::new(conns.into()),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self) -> Result<PushConnection, FeedError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| FeedError::Connection("connection refused".into()))
    }
}

/// Server side of an in-memory push connection.
struct Server {
    sent: fmpsc::UnboundedReceiver<String>,
    push: fmpsc::UnboundedSender<Result<String, FeedError>>,
}

impl Server {
    fn push_update(&self, asset: &str, apy: f64) {
        let frame = json!({ "type": "apy_update", "data": { "asset": asset, "apy": apy } });
        self.push.unbounded_send(Ok(frame.to_string())).unwrap();
    }

    fn push_raw(&self, frame: Value) {
        self.push.unbounded_send(Ok(frame.to_string())).unwrap();
    }

    /// Every frame the client has written so far.
    fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(Some(raw)) = self.sent.next().now_or_never() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }
}

fn pipe() -> (PushConnection, Server) {
    let (out_tx, out_rx) = fmpsc::unbounded::<String>();
    let (in_tx, in_rx) = fmpsc::unbounded::<Result<String, FeedError>>();

    let sink = out_tx.sink_map_err(|e| FeedError::Connection(e.to_string()));
    let conn = PushConnection::new(sink, in_rx);

    (conn, Server { sent: out_rx, push: in_tx })
}

#[derive(Default)]
struct MockSource {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MockSource {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MarketDataSource for MockSource {
    async fn fetch_updates(&self, keys: &[String]) -> Result<Vec<RawUpdate>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(FeedError::Upstream("503 service unavailable".into()));
        }
        Ok(keys.iter().map(|k| RawUpdate::new(k.clone(), 1.5)).collect())
    }

    async fn fetch_history(&self, _key: &str, _period: HistoryPeriod) -> Result<Vec<HistoricalPoint>, FeedError> {
        Ok(vec![HistoricalPoint {
            timestamp_ms: 1,
            apy: 4.0,
            tvl: 100.0,
        }])
    }
}

fn spawn(
    connector: &Arc<ScriptedConnector>,
    source: &Arc<MockSource>,
) -> LiveMarketClient<MockSource> {
    LiveMarketClient::spawn(FeedConfig::default(), Arc::clone(connector), Arc::clone(source))
}

/// Wait until the refresh triggered by `subscribe` has landed for every key.
async fn settled(view: &mut market::MarketView, keys: &[&str]) {
    view.wait_for(|s| !s.loading && keys.iter().all(|k| s.get(k).is_some()))
        .await
        .unwrap();
}

fn subscribe_msg(keys: &[&str]) -> Value {
    json!({ "type": "subscribe", "assets": keys })
}

// ---------------------------------------------------------------------------
// transport
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts_until_reopened() {
    let connector = Arc::new(ScriptedConnector::failing());
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();
    let mut events = client.events();

    client.open();

    let state = view
        .wait_for(|s| matches!(s.connection, ConnectionState::Degraded { .. }))
        .await
        .unwrap();
    assert_eq!(connector.attempts(), 5);
    assert!(state.error.is_some());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 5);

    let mut failures = 0;
    let mut exhausted = false;
    while let Ok(ev) = events.try_recv() {
        match ev {
            FeedEvent::ConnectFailed { .. } => failures += 1,
            FeedEvent::ReconnectExhausted { attempts } => {
                assert_eq!(attempts, 5);
                exhausted = true;
            }
            _ => {}
        }
    }
    assert_eq!(failures, 5);
    assert!(exhausted);

    // explicit open resets the budget
    client.open();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 10);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn replays_one_subscribe_after_reconnect() {
    let (conn1, mut server1) = pipe();
    let (conn2, mut server2) = pipe();
    let connector = Arc::new(ScriptedConnector::with(vec![conn1, conn2]));
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.subscribe(["XLM"]);
    client.open();
    view.wait_for(|s| s.is_connected()).await.unwrap();
    assert_eq!(server1.drain(), vec![subscribe_msg(&["XLM"])]);

    drop(server1);
    view.wait_for(|s| !s.is_connected()).await.unwrap();

    client.unsubscribe(["XLM"]);
    client.subscribe(["XLM"]);

    view.wait_for(|s| s.is_connected()).await.unwrap();
    assert_eq!(server2.drain(), vec![subscribe_msg(&["XLM"])]);
    assert_eq!(connector.attempts(), 2);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_connected_sends_only_new_keys() {
    let (conn, mut server) = pipe();
    let connector = Arc::new(ScriptedConnector::with(vec![conn]));
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.open();
    view.wait_for(|s| s.is_connected()).await.unwrap();
    assert!(server.drain().is_empty());

    client.subscribe(["XLM"]);
    client.subscribe(["XLM", "USDC"]);
    view.wait_for(|s| s.get("USDC").is_some()).await.unwrap();

    assert_eq!(
        server.drain(),
        vec![subscribe_msg(&["XLM"]), subscribe_msg(&["USDC"])]
    );

    client.unsubscribe(["XLM", "ETH"]);
    let state = view.wait_for(|s| s.get("XLM").is_none()).await.unwrap();
    assert!(state.get("USDC").is_some());
    assert_eq!(
        server.drain(),
        vec![json!({ "type": "unsubscribe", "assets": ["XLM"] })]
    );

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn close_cancels_reconnects() {
    let (conn, server) = pipe();
    let connector = Arc::new(ScriptedConnector::with(vec![conn]));
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.subscribe(["XLM"]);
    client.open();
    view.wait_for(|s| s.is_connected()).await.unwrap();

    client.close();
    let state = view.wait_for(|s| !s.is_connected()).await.unwrap();
    assert_eq!(state.connection, ConnectionState::Disconnected);
    assert!(!state.fallback_active);

    drop(server);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(!view.current().fallback_active);

    client.shutdown().await;
}

// ---------------------------------------------------------------------------
// data
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pushes_for_unknown_keys_are_ignored() {
    let (conn, server) = pipe();
    let connector = Arc::new(ScriptedConnector::with(vec![conn]));
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.subscribe(["XLM"]);
    settled(&mut view, &["XLM"]).await;
    client.open();
    view.wait_for(|s| s.is_connected()).await.unwrap();

    server.push_raw(json!({
        "type": "apy_update",
        "data": [
            { "asset": "ETH", "apy": 3.0 },
            { "asset": "XLM", "apy": "7.25", "risk": "high", "tvl": "1200" }
        ]
    }));

    let state = view
        .wait_for(|s| s.get("XLM").is_some_and(|x| x.source == Source::Push))
        .await
        .unwrap();

    let xlm = state.get("XLM").unwrap();
    assert_eq!(xlm.value, 7.25);
    assert_eq!(xlm.metrics.tvl, 1200.0);
    assert_eq!(xlm.risk, common::RiskLevel::High);
    assert!(state.get("ETH").is_none());
    assert!(state.last_update_ms.is_some());

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn server_errors_surface_in_state() {
    let (conn, server) = pipe();
    let connector = Arc::new(ScriptedConnector::with(vec![conn]));
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.open();
    view.wait_for(|s| s.is_connected()).await.unwrap();

    server.push_raw(json!({ "type": "error", "data": { "message": "rate limited" } }));
    let state = view.wait_for(|s| s.error.is_some()).await.unwrap();
    assert_eq!(state.error.as_deref(), Some("rate limited"));
    assert!(state.is_connected());

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_pulls_subscribed_keys() {
    let connector = Arc::new(ScriptedConnector::failing());
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.subscribe(["XLM"]);
    let state = view
        .wait_for(|s| s.get("XLM").is_some() && !s.loading)
        .await
        .unwrap();
    assert_eq!(state.get("XLM").unwrap().source, Source::Poll);
    assert_eq!(source.calls(), 1);

    source.fail.store(true, Ordering::SeqCst);
    client.refresh_data();
    let state = view.wait_for(|s| s.error.is_some()).await.unwrap();
    assert!(state.error.as_deref().unwrap().contains("503"));
    // the failed pull keeps the last good snapshot
    assert!(state.get("XLM").is_some());

    client.shutdown().await;
}

#[tokio::test]
async fn historical_validates_key() {
    let connector = Arc::new(ScriptedConnector::failing());
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);

    assert!(matches!(
        client.historical("  ", HistoryPeriod::OneDay).await,
        Err(FeedError::InvalidParameters(_))
    ));

    let points = client.historical("XLM", HistoryPeriod::SevenDays).await.unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].apy, 4.0);

    client.shutdown().await;
}

// ---------------------------------------------------------------------------
// polling fallback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fallback_polls_until_every_key_is_pushed() {
    let (conn1, server1) = pipe();
    let (conn2, server2) = pipe();
    let connector = Arc::new(ScriptedConnector::with(vec![conn1, conn2]));
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.subscribe(["XLM", "USDC"]);
    settled(&mut view, &["XLM", "USDC"]).await;
    client.open();
    view.wait_for(|s| s.is_connected()).await.unwrap();
    assert!(!view.current().fallback_active);
    let calls_before = source.calls();

    drop(server1);
    let state = view.wait_for(|s| s.fallback_active).await.unwrap();
    assert!(!state.is_connected());
    assert_eq!(state.fallback_reason, Some(FallbackReason::Disconnected));

    // reconnecting alone does not stand the fallback down
    view.wait_for(|s| s.is_connected()).await.unwrap();
    assert!(view.current().fallback_active);
    assert!(source.calls() > calls_before);

    server2.push_update("XLM", 5.0);
    view.wait_for(|s| s.get("XLM").is_some_and(|x| x.source == Source::Push))
        .await
        .unwrap();
    assert!(view.current().fallback_active);

    server2.push_update("USDC", 6.0);
    let state = view.wait_for(|s| !s.fallback_active).await.unwrap();
    assert!(state.is_connected());
    assert!(state.fallback_reason.is_none());

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_key_triggers_polling_while_connected() {
    let (conn, server) = pipe();
    let connector = Arc::new(ScriptedConnector::with(vec![conn]));
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();
    let mut events = client.events();

    client.subscribe(["XLM"]);
    settled(&mut view, &["XLM"]).await;
    client.open();
    view.wait_for(|s| s.is_connected()).await.unwrap();

    server.push_update("XLM", 2.0);
    view.wait_for(|s| s.get("XLM").is_some_and(|x| x.source == Source::Push))
        .await
        .unwrap();

    let state = view.wait_for(|s| s.fallback_active).await.unwrap();
    assert!(state.is_connected());
    assert!(matches!(
        &state.fallback_reason,
        Some(FallbackReason::Stale { key, .. }) if key == "XLM"
    ));

    let mut stale_key = None;
    while let Ok(ev) = events.try_recv() {
        if let FeedEvent::FallbackActivated(FallbackReason::Stale { key, age_ms }) = ev {
            assert!(age_ms > 60_000);
            stale_key = Some(key);
        }
    }
    assert_eq!(stale_key.as_deref(), Some("XLM"));

    // a fresh push for the only key stands polling down again
    server.push_update("XLM", 2.5);
    view.wait_for(|s| !s.fallback_active).await.unwrap();

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_polling_and_clears_data() {
    let connector = Arc::new(ScriptedConnector::failing());
    let source = Arc::new(MockSource::default());
    let client = spawn(&connector, &source);
    let mut view = client.view();

    client.subscribe(["XLM"]);
    client.open();
    view.wait_for(|s| s.fallback_active && s.get("XLM").is_some())
        .await
        .unwrap();

    client.shutdown().await;

    let state = view.current();
    assert!(state.snapshots.is_empty());
    assert_eq!(state.connection, ConnectionState::Disconnected);

    let calls = source.calls();
    let attempts = connector.attempts();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(source.calls(), calls);
    assert_eq!(connector.attempts(), attempts);
}
