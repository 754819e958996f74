use thiserror::Error;

#[derive(Debug, Error)]
pub enum HearthError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl HearthError {
    /// Short machine-readable code, logged next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            HearthError::Config(_) => "CONFIG_ERROR",
            HearthError::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
        }
    }
}

pub type Result<T> = std::result::Result<T, HearthError>;
