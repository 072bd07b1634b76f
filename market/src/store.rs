use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::errors::FeedError;
use crate::types::{ConnectionState, DataQuality, FallbackReason, MarketSnapshot};

/// Everything a rendering layer needs, published as one immutable value.
#[derive(Clone, Debug, Default)]
pub struct MarketState {
    pub snapshots: Arc<BTreeMap<String, MarketSnapshot>>,
    pub quality: DataQuality,
    pub connection: ConnectionState,
    pub fallback_active: bool,

    /// Why polling is running; `None` while it is off.
    pub fallback_reason: Option<FallbackReason>,

    /// At least one on-demand refresh is outstanding.
    pub loading: bool,

    pub last_update_ms: Option<u64>,

    /// Latest connection or upstream failure; cleared on the next success.
    pub error: Option<String>,
}

impl MarketState {
    pub fn get(&self, key: &str) -> Option<&MarketSnapshot> {
        self.snapshots.get(key)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}

/// Write side of the published view. Owned by the feed driver; every
/// publish replaces the whole state atomically.
pub struct MarketViewStore {
    tx: watch::Sender<Arc<MarketState>>,
}

impl MarketViewStore {
    pub fn channel() -> (Self, MarketView) {
        let (tx, rx) = watch::channel(Arc::new(MarketState::default()));
        (Self { tx }, MarketView { rx })
    }

    pub fn publish(&self, state: MarketState) {
        self.tx.send_replace(Arc::new(state));
    }

    pub fn current(&self) -> Arc<MarketState> {
        self.tx.borrow().clone()
    }
}

/// Read-only handle to the latest [`MarketState`]. Cheap to clone.
#[derive(Clone)]
pub struct MarketView {
    rx: watch::Receiver<Arc<MarketState>>,
}

impl MarketView {
    pub fn current(&self) -> Arc<MarketState> {
        self.rx.borrow().clone()
    }

    /// Wait for the next publish.
    pub async fn changed(&mut self) -> Result<Arc<MarketState>, FeedError> {
        self.rx.changed().await.map_err(|_| FeedError::Closed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until a published state satisfies `pred` (checks the current one first).
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Result<Arc<MarketState>, FeedError>
    where
        F: FnMut(&MarketState) -> bool,
    {
        let state = self
            .rx
            .wait_for(|s| pred(s.as_ref()))
            .await
            .map_err(|_| FeedError::Closed)?;
        Ok(Arc::clone(&*state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_see_whole_states() {
        let (store, mut view) = MarketViewStore::channel();
        assert_eq!(view.current().quality, DataQuality::Poor);

        store.publish(MarketState {
            quality: DataQuality::Good,
            connection: ConnectionState::Connected,
            ..Default::default()
        });

        let s = view.changed().await.unwrap();
        assert_eq!(s.quality, DataQuality::Good);
        assert!(s.is_connected());
        assert_eq!(store.current().quality, DataQuality::Good);
    }

    #[tokio::test]
    async fn closed_store_ends_readers() {
        let (store, mut view) = MarketViewStore::channel();
        drop(store);
        assert!(matches!(view.changed().await, Err(FeedError::Closed)));
    }
}
