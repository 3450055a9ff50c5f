pub mod error;
pub mod service;

pub use error::StatsError;
pub use service::{StatsService, StatsSummary};
