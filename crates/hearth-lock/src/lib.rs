//! `hearth-lock` — named advisory locks backed by `flock(2)`.
//!
//! Each lock name maps to `<dir>/<sha256(name)>.lock`. Acquisition polls a
//! non-blocking exclusive lock until a timeout elapses, so any process on the
//! same host that shares the directory is excluded. Cooperative only: nothing
//! stops a caller that ignores the lock.

pub mod error;
#[cfg(unix)]
pub mod manager;

pub use error::{LockError, Result};
#[cfg(unix)]
pub use manager::{LockGuard, LockManager};
