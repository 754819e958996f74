use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hearth_core::config::WorkerConfig;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::policy::{Decision, RetryPolicy};
use crate::queue::Queue;
use crate::registry::HandlerRegistry;
use crate::types::Job;

/// Why a claimed job did not complete. Never leaves the worker loop; it is
/// logged and recorded as the job's `exception` text.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no handler registered for job '{0}'")]
    UnknownJob(String),

    #[error("undecodable payload: {0}")]
    Payload(String),

    #[error("{0:#}")]
    Handler(anyhow::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// How one claimed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retried { delay_secs: u64 },
    Failed,
}

/// What to write back for a job once its handler has run.
#[derive(Debug, Clone)]
enum Ack {
    Delete,
    Release { delay_secs: u64 },
    Fail { exception: String },
}

impl Ack {
    fn outcome(&self) -> Outcome {
        match self {
            Ack::Delete => Outcome::Succeeded,
            Ack::Release { delay_secs } => Outcome::Retried {
                delay_secs: *delay_secs,
            },
            Ack::Fail { .. } => Outcome::Failed,
        }
    }
}

/// Counters returned when [`Worker::run`] stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Retried { .. } => self.retried += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Loop settings for one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue: String,
    pub poll_interval: Duration,
    /// Stop after this many jobs; `None` runs until shutdown.
    pub max_jobs: Option<u64>,
    /// Release reservations older than this while idle; `None` disables it.
    pub reclaim_after_secs: Option<u64>,
}

impl WorkerOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_jobs: None,
            reclaim_after_secs: config.reclaim_after_secs,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// Drains one queue: claim, run, then delete / release / fail.
pub struct Worker {
    id: String,
    queue: Arc<Queue>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    options: WorkerOptions,
    /// Acknowledgement that hit a busy database; written before the next claim.
    pending: Mutex<Option<(i64, Ack)>>,
}

impl Worker {
    pub fn new(
        queue: Arc<Queue>,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        options: WorkerOptions,
    ) -> Self {
        Self {
            // UUIDv7 sorts by start time, which makes worker logs easy to line up
            id: Uuid::now_v7().to_string(),
            queue,
            registry,
            policy,
            options,
            pending: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Main loop. Returns when `max_jobs` is reached or `shutdown` flips to
    /// `true`. Shutdown is only observed between jobs; a running handler is
    /// never interrupted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!(worker_id = %self.id, queue = %self.options.queue, "worker started");
        let mut stats = WorkerStats::default();

        loop {
            if *shutdown.borrow() {
                info!(worker_id = %self.id, "worker shutting down");
                break;
            }
            if self.options.max_jobs.is_some_and(|max| stats.processed >= max) {
                info!(worker_id = %self.id, processed = stats.processed, "job limit reached");
                break;
            }

            match self.process_next() {
                Ok(Some(outcome)) => {
                    stats.record(outcome);
                    continue;
                }
                Ok(None) => self.reclaim_if_configured(),
                Err(e) => error!(worker_id = %self.id, "worker poll error: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!(worker_id = %self.id, "shutdown channel closed; stopping");
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            retried = stats.retried,
            failed = stats.failed,
            "worker stopped"
        );
        stats
    }

    /// Claim and resolve at most one job. `Ok(None)` means the queue had
    /// nothing eligible.
    ///
    /// Errors are storage errors from the claim or the acknowledgement; job
    /// failures are handled here and reported through [`Outcome`]. An
    /// acknowledgement that fails because the database stayed busy is kept
    /// and written by the next call before anything new is claimed, so the
    /// job doesn't stay reserved after its handler has run.
    pub fn process_next(&self) -> Result<Option<Outcome>> {
        let deferred = self.pending_ack().take();
        if let Some((job_id, ack)) = deferred {
            debug!(job_id, "retrying deferred acknowledgement");
            return self.settle(job_id, ack).map(Some);
        }

        let Some(job) = self.queue.pop(&self.options.queue)? else {
            return Ok(None);
        };

        let ack = match self.execute(&job) {
            Ok(()) => Ack::Delete,
            Err(e) => {
                error!(
                    job_id = job.id,
                    queue = %job.queue,
                    attempts = job.attempts,
                    error = %e,
                    "job failed"
                );
                match self.policy.decide(job.attempts) {
                    Decision::Release { delay_secs } => Ack::Release { delay_secs },
                    Decision::Fail => Ack::Fail {
                        exception: e.to_string(),
                    },
                }
            }
        };
        self.settle(job.id, ack).map(Some)
    }

    /// Write `ack` for `job_id`, parking it if the database is busy.
    fn settle(&self, job_id: i64, ack: Ack) -> Result<Outcome> {
        let written = match &ack {
            Ack::Delete => self.queue.delete_job(job_id),
            Ack::Release { delay_secs } => self.queue.release(job_id, *delay_secs),
            Ack::Fail { exception } => self.queue.mark_failed(job_id, exception),
        };

        match written {
            Ok(_) => {
                let outcome = ack.outcome();
                match outcome {
                    Outcome::Succeeded => info!(job_id, "job succeeded"),
                    Outcome::Retried { delay_secs } => {
                        info!(job_id, delay_secs, "job released for retry")
                    }
                    Outcome::Failed => {}
                }
                Ok(outcome)
            }
            Err(e) if e.is_busy() => {
                warn!(job_id, error = %e, "acknowledgement deferred");
                *self.pending_ack() = Some((job_id, ack));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn pending_ack(&self) -> MutexGuard<'_, Option<(i64, Ack)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the payload's handler and run it, turning panics into errors.
    pub fn execute(&self, job: &Job) -> std::result::Result<(), WorkerError> {
        let payload = job
            .decode_payload()
            .map_err(|e| WorkerError::Payload(e.to_string()))?;
        let handler = self
            .registry
            .resolve(&payload.job)
            .ok_or_else(|| WorkerError::UnknownJob(payload.job.clone()))?;

        debug!(job_id = job.id, job = %payload.job, "executing job");
        match catch_unwind(AssertUnwindSafe(|| handler.handle(&payload.data))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WorkerError::Handler(e)),
            Err(panic) => Err(WorkerError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn reclaim_if_configured(&self) {
        let Some(older_than) = self.options.reclaim_after_secs else {
            return;
        };
        if let Err(e) = self.queue.reclaim_stale(&self.options.queue, older_than) {
            error!(worker_id = %self.id, "stale reservation sweep failed: {e}");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
