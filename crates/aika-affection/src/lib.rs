pub mod error;
pub mod service;

pub use error::AffectionError;
pub use service::{AffectionInfo, AffectionService, MAX_SCORE, MIN_SCORE};
