use thiserror::Error;

#[derive(Debug, Error)]
pub enum AikaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown provider: {name}")]
    UnknownProvider { name: String },

    #[error("Chat adapter error: {0}")]
    Adapter(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AikaError>;
