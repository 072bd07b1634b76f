use std::sync::Arc;
use std::time::Duration;

use common::logger::{child_span, warn_if_slow};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, warn};

use crate::config::FeedConfig;
use crate::driver::{Command, FeedDriver};
use crate::errors::FeedError;
use crate::protocol::OutboundMessage;
use crate::source::MarketDataSource;
use crate::store::{MarketState, MarketView, MarketViewStore};
use crate::transport::PushConnector;
use crate::types::{FeedEvent, HistoricalPoint, HistoryPeriod, MarketSnapshot};

/// Handle to one live market feed.
///
/// Commands are fire-and-forget: failures never propagate to the caller and
/// show up instead in the published [`MarketState`] and as [`FeedEvent`]s.
/// Dropping the handle (or calling [`LiveMarketClient::shutdown`]) stops the
/// driver task, every timer and all in-flight work.
pub struct LiveMarketClient<S> {
    commands: mpsc::UnboundedSender<Command>,
    view: MarketView,
    events: broadcast::Sender<FeedEvent>,
    source: Arc<S>,
    slow_request: Duration,
    driver: JoinHandle<()>,
}

impl<S: MarketDataSource> LiveMarketClient<S> {
    /// Start the driver task. The push channel stays closed until [`Self::open`].
    pub fn spawn<C: PushConnector>(config: FeedConfig, connector: Arc<C>, source: Arc<S>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (store, view) = MarketViewStore::channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let slow_request = config.slow_request;

        let driver = FeedDriver::new(config, connector, Arc::clone(&source), rx, store, events.clone());
        let driver = tokio::spawn(driver.run().instrument(child_span("live_market")));

        Self {
            commands,
            view,
            events,
            source,
            slow_request,
            driver,
        }
    }

    /// Connect the push channel. No-op while connecting or connected.
    pub fn open(&self) {
        self.dispatch(Command::Open);
    }

    /// Drop the connection, cancel pending reconnects and stop polling.
    pub fn close(&self) {
        self.dispatch(Command::Close);
    }

    /// `close()` followed by a fresh `open()` with the attempt budget reset.
    pub fn reconnect(&self) {
        self.dispatch(Command::Reconnect);
    }

    pub fn subscribe<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.dispatch(Command::Subscribe(keys.into_iter().map(Into::into).collect()));
    }

    pub fn unsubscribe<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.dispatch(Command::Unsubscribe(keys.into_iter().map(Into::into).collect()));
    }

    /// Pull every subscribed key once, outside the fallback schedule.
    pub fn refresh_data(&self) {
        self.dispatch(Command::Refresh);
    }

    /// Send a raw outbound frame. Dropped with a warning when not connected.
    pub fn send(&self, message: OutboundMessage) {
        self.dispatch(Command::Send(message));
    }

    pub fn view(&self) -> MarketView {
        self.view.clone()
    }

    pub fn state(&self) -> Arc<MarketState> {
        self.view.current()
    }

    pub fn snapshot(&self, key: &str) -> Option<MarketSnapshot> {
        self.view.current().get(key).cloned()
    }

    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    /// Historical yield points for `key`, fetched straight from the pull source.
    pub async fn historical(&self, key: &str, period: HistoryPeriod) -> Result<Vec<HistoricalPoint>, FeedError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(FeedError::InvalidParameters("asset key must not be empty".into()));
        }

        warn_if_slow("apy_history", self.slow_request, self.source.fetch_history(key, period)).await
    }

    /// Stop the driver and wait for it to finish tearing down.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);

        if let Err(e) = self.driver.await {
            if e.is_panic() {
                error!(error = %e, "live market driver panicked");
            }
        }
    }

    fn dispatch(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            warn!("live market driver has stopped; command dropped");
        }
    }
}
