use thiserror::Error;

#[derive(Debug, Error)]
pub enum JamError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown court: {0}")]
    UnknownCourt(String),

    #[error("Duplicate state: {0}")]
    Duplicate(String),

    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl JamError {
    /// Milliseconds until the caller may retry, where the error carries one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            JamError::RateLimit { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
