use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures inside the live market feed.
///
/// None of these ever escape to a consumer as a panic: the driver turns them
/// into connection state, an `error` field on the published view, or a
/// [`crate::types::FeedEvent`].
#[derive(Error, Debug)]
pub enum FeedError {
    /// Transport failed to open or dropped unexpectedly.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Caller supplied a malformed request.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Non-2xx response, malformed body, or unparsable push frame.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// The client was shut down.
    #[error("live feed closed")]
    Closed,
}
