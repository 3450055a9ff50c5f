use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("model error: {0}")]
    Model(#[from] aika_llm::LlmError),

    #[error("extraction parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
