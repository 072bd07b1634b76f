use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, instrument};

use crate::errors::FeedError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = FeedError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, FeedError>> + Send>>;

/// An open push connection, already split into its text halves.
///
/// The stream ending (or yielding an error) means the connection is gone.
pub struct PushConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl PushConnection {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = FeedError> + Send + 'static,
        St: Stream<Item = Result<String, FeedError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Performs one handshake per call. Retry policy lives in the driver.
#[async_trait]
pub trait PushConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<PushConnection, FeedError>;
}

/// WebSocket implementation of [`PushConnector`].
pub struct WsConnector {
    pub ws_url: String,
    pub handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    #[instrument(skip(self), fields(url = %self.ws_url))]
    async fn connect(&self) -> Result<PushConnection, FeedError> {
        debug!("Attempting connection to live APY WebSocket");

        let (ws, _) = tokio::time::timeout(self.handshake_timeout, connect_async(self.ws_url.as_str()))
            .await
            .map_err(|_| FeedError::Connection("websocket handshake timed out".into()))??;

        info!("WebSocket connection established");
        let (write, read) = ws.split();

        let sink = write.with(|text: String| future::ready(Ok::<_, FeedError>(Message::Text(text.into()))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(t)) => Some(Ok(t.to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Server sent close frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(FeedError::from(e))),
            })
        });

        Ok(PushConnection::new(sink, stream))
    }
}

/// Exponential reconnect schedule.
///
/// ```text
/// delay(n) = min(base_delay * multiplier^(n - 1), max_delay)
/// ```
///
/// `n` is the 1-based retry number. After `max_attempts` consecutive failed
/// handshakes the driver gives up and reports `degraded`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exp);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.max_delay)
    }

    pub fn exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.max_attempts
    }
}
