pub mod coordinator;
pub mod errors;
pub mod scorer;
pub mod source;
pub mod types;

pub use coordinator::{CoordinatorConfig, RequestCoordinator};
pub use errors::RouteError;
pub use scorer::{RouteScorer, ScorerConfig};
pub use source::{HttpQuoteSource, QuoteSource};
pub use types::{RouteOptions, RouteQuote, ScoredQuote};
