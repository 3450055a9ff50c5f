use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("index error: {0}")]
    Index(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] aika_llm::LlmError),

    #[error("vector dimension mismatch: got {got}, index holds {expected}")]
    DimensionMismatch { got: usize, expected: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory disabled by configuration")]
    Disabled,
}

pub type Result<T> = std::result::Result<T, MemoryError>;
