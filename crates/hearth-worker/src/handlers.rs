//! Handlers the `hearth work` binary ships with.
//!
//! Any built-in job whose data carries `"lock": "<name>"` runs while holding
//! that advisory lock, so two workers on the same host never run it at once.

use std::sync::Arc;
use std::time::Duration;

use hearth_lock::LockManager;
use hearth_queue::{HandlerRegistry, JobHandler};
use serde_json::{Map, Value};
use tracing::info;

/// Upper bound for the `sleep` job so a typo can't park a worker for hours.
const MAX_SLEEP_MS: u64 = 60_000;

/// Runs `inner` under the lock named by the job's `lock` field, if any.
pub struct LockAware<H> {
    locks: Arc<LockManager>,
    inner: H,
}

impl<H: JobHandler> LockAware<H> {
    pub fn new(locks: Arc<LockManager>, inner: H) -> Self {
        Self { locks, inner }
    }
}

impl<H: JobHandler> JobHandler for LockAware<H> {
    fn handle(&self, data: &Map<String, Value>) -> anyhow::Result<()> {
        match data.get("lock").and_then(Value::as_str) {
            Some(name) => {
                let timeout = self.locks.default_timeout();
                self.locks.run(name, timeout, || self.inner.handle(data))?
            }
            None => self.inner.handle(data),
        }
    }
}

/// Logs the job data.
pub struct LogJob;

impl JobHandler for LogJob {
    fn handle(&self, data: &Map<String, Value>) -> anyhow::Result<()> {
        let message = data.get("message").and_then(Value::as_str).unwrap_or("");
        info!(message, data = %serde_json::Value::Object(data.clone()), "log job");
        Ok(())
    }
}

/// Sleeps for `ms` milliseconds (capped).
pub struct SleepJob;

impl JobHandler for SleepJob {
    fn handle(&self, data: &Map<String, Value>) -> anyhow::Result<()> {
        let ms = data
            .get("ms")
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| anyhow::anyhow!("'ms' must be a non-negative integer"))
            })
            .transpose()?
            .unwrap_or(0);
        std::thread::sleep(Duration::from_millis(ms.min(MAX_SLEEP_MS)));
        Ok(())
    }
}

/// `log`, `sleep` and `noop`, each honouring the `lock` field.
pub fn builtin_registry(locks: Arc<LockManager>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("log", LockAware::new(Arc::clone(&locks), LogJob))
        .register("sleep", LockAware::new(Arc::clone(&locks), SleepJob))
        .register(
            "noop",
            LockAware::new(locks, |_: &Map<String, Value>| -> anyhow::Result<()> { Ok(()) }),
        );
    registry
}
