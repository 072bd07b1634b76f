pub mod client;
pub mod config;
mod driver;
pub mod errors;
pub mod poller;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod source;
pub mod store;
pub mod transport;
pub mod types;

pub use client::LiveMarketClient;
pub use config::FeedConfig;
pub use errors::FeedError;
pub use source::{HttpMarketSource, MarketDataSource};
pub use store::{MarketState, MarketView};
pub use transport::{BackoffPolicy, PushConnection, PushConnector, WsConnector};
