use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unparseable response: {0}")]
    Parse(String),

    #[error("model role '{role}' is disabled")]
    Disabled { role: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not expose the configured timeout here; callers
            // log the role's value alongside.
            LlmError::Timeout { secs: 0 }
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}
