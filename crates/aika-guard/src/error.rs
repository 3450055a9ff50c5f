use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("model error: {0}")]
    Model(#[from] aika_llm::LlmError),

    /// The classifier emitted neither `true` nor `false`. The orchestrator
    /// treats this as fail-open.
    #[error("unclassifiable guard output: {output}")]
    Unclassified { output: String },
}

pub type Result<T> = std::result::Result<T, GuardError>;
