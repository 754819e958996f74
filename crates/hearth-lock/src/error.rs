use std::time::Duration;

use thiserror::Error;

/// Errors raised by the advisory lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be taken before the deadline.
    #[error("timed out after {timeout:?} waiting for lock '{name}'")]
    Timeout { name: String, timeout: Duration },

    /// Opening, locking or writing the backing file failed.
    #[error("lock file error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;
