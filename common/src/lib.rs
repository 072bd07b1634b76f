pub mod logger;
pub mod num;
pub mod time;
pub mod types;

pub use types::RiskLevel;
