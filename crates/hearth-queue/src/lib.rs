//! `hearth-queue` — durable job queue and worker loop over SQLite.
//!
//! # Overview
//!
//! Jobs live in a `jobs` table. [`queue::Queue::pop`] claims the oldest
//! eligible row with a single conditional UPDATE, so concurrent workers on
//! separate connections never reserve the same job. A [`worker::Worker`]
//! drains one queue, runs each payload through the [`registry::HandlerRegistry`]
//! and applies the [`policy::RetryPolicy`]:
//!
//! | Outcome              | Effect                                            |
//! |----------------------|---------------------------------------------------|
//! | handler returns `Ok` | row deleted                                       |
//! | error, attempts < 3  | released, visible again after `60 * attempts` s   |
//! | error, attempts >= 3 | copied to `failed_jobs`, then deleted             |
//!
//! Delivery is at-least-once. A worker that dies mid-job leaves its
//! reservation in place until [`queue::Queue::reclaim_stale`] releases it.

pub mod db;
pub mod error;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod types;
pub mod worker;

pub use error::{QueueError, Result};
pub use policy::{Decision, RetryPolicy};
pub use queue::Queue;
pub use registry::{HandlerRegistry, JobHandler};
pub use storage::Storage;
pub use types::{FailedJob, Job, Payload};
pub use worker::{Outcome, Worker, WorkerError, WorkerOptions, WorkerStats};
