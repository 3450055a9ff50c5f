use thiserror::Error;

#[derive(Debug, Error)]
pub enum AffectionError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("user not found: {user_id}")]
    UserNotFound { user_id: String },
}

pub type Result<T> = std::result::Result<T, AffectionError>;
