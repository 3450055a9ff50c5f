pub mod client;
pub mod embedding;
pub mod error;
pub mod trace;
pub mod vision;

pub use client::{ChatMessage, ChatOutcome, LlmClient, ModelClient, Role};
pub use embedding::{Embedder, EmbeddingClient};
pub use error::LlmError;
pub use trace::{TraceLogger, TraceRecord};
