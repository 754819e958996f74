use thiserror::Error;

/// Errors surfaced by storage and queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite / rusqlite error that is not worth retrying.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The database stayed busy or locked through every retry.
    #[error("Storage operation failed after {attempts} attempts: {source}")]
    StorageOperationFailed {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// The job payload could not be encoded or decoded.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Job data must serialize to a JSON object (or null for "no data").
    #[error("Invalid job data: {0}")]
    InvalidData(String),

    /// `now + delay` falls past the last storable timestamp (9999-12-31).
    #[error("Delay of {delay_secs}s is out of range")]
    DelayOutOfRange { delay_secs: u64 },

    #[error(transparent)]
    Core(#[from] hearth_core::HearthError),
}

impl QueueError {
    /// True when the database was only contended; the same call may succeed later.
    pub fn is_busy(&self) -> bool {
        matches!(self, QueueError::StorageOperationFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
