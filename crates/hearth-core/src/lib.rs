//! `hearth-core` — configuration, errors and the time source shared by the
//! queue, lock and worker crates.

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::HearthConfig;
pub use error::{HearthError, Result};
