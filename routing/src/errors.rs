use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Superseded by a newer request for the same pair, or cleared.
    /// Not a failure.
    #[error("route request cancelled")]
    Cancelled,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl RouteError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
