use hearth_core::config::{WorkerConfig, DEFAULT_BACKOFF_SECS, DEFAULT_MAX_ATTEMPTS};
use serde::{Deserialize, Serialize};

/// What to do with a job whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    /// Put it back, visible again after `delay_secs`.
    Release { delay_secs: u64 },
    /// Give up and move it to `failed_jobs`.
    Fail,
}

/// Linear retry policy: release with `backoff_secs * attempts` until the job
/// has been claimed `max_attempts` times, then fail it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_secs: DEFAULT_BACKOFF_SECS,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_secs: config.backoff_secs,
        }
    }

    /// `attempts` is the job's claim count including the one that just failed.
    pub fn decide(&self, attempts: u32) -> Decision {
        if attempts >= self.max_attempts {
            Decision::Fail
        } else {
            Decision::Release {
                delay_secs: self.backoff_secs.saturating_mul(u64::from(attempts)),
            }
        }
    }
}
