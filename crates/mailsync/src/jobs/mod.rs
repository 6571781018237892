//! Background sync jobs
//!
//! Sync passes run as jobs on a priority queue. The [`Scheduler`] decides
//! what to enqueue, the [`Worker`] reserves jobs and dispatches them to the
//! [`SyncEngine`](crate::engine::SyncEngine).

mod queue;
mod scheduler;
mod worker;

pub use queue::{FailOutcome, InMemoryJobQueue, Job, JobId, JobQueue, JobStatus};
pub use scheduler::{Scheduler, recurring_key};
pub use worker::{JobOutcome, Worker, WorkerHandle};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runs before everything else (expired cursors)
pub const PRIORITY_URGENT: u8 = 1;
/// User-initiated syncs and continuations
pub const PRIORITY_HIGH: u8 = 2;
/// Recurring and automatically scheduled syncs
pub const PRIORITY_NORMAL: u8 = 5;
/// Housekeeping
pub const PRIORITY_LOW: u8 = 10;

/// Key of the repeating cursor-expiry check
pub const CURSOR_CHECK_KEY: &str = "cursor-check";

/// What a job does, with its typed payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncJob {
    FullSync { user_id: String, resume: bool },
    IncrementalSync { user_id: String },
    MetadataSync { user_id: String },
    CursorCheck,
}

impl SyncJob {
    pub fn name(&self) -> &'static str {
        match self {
            SyncJob::FullSync { .. } => "full_sync",
            SyncJob::IncrementalSync { .. } => "incremental_sync",
            SyncJob::MetadataSync { .. } => "metadata_sync",
            SyncJob::CursorCheck => "cursor_check",
        }
    }

    /// The user this job syncs, if any
    pub fn user_id(&self) -> Option<&str> {
        match self {
            SyncJob::FullSync { user_id, .. }
            | SyncJob::IncrementalSync { user_id }
            | SyncJob::MetadataSync { user_id } => Some(user_id),
            SyncJob::CursorCheck => None,
        }
    }

    /// Deduplication key: at most one waiting job per key
    pub fn dedupe_key(&self) -> String {
        match self.user_id() {
            Some(user_id) => format!("{}:{}", self.name(), user_id),
            None => self.name().to_string(),
        }
    }

    /// Retry policy for this kind of job
    pub fn default_options(&self) -> JobOptions {
        let (attempts, backoff) = match self {
            SyncJob::FullSync { .. } => (3, Duration::from_secs(60)),
            SyncJob::IncrementalSync { .. } => (5, Duration::from_secs(10)),
            SyncJob::MetadataSync { .. } => (3, Duration::from_secs(5)),
            SyncJob::CursorCheck => (1, Duration::ZERO),
        };
        JobOptions {
            attempts,
            backoff,
            ..JobOptions::default()
        }
    }
}

/// Scheduling and retry options of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower runs first
    pub priority: u8,
    /// Earliest start, relative to enqueue time
    pub delay: Duration,
    /// Total attempts including the first
    pub attempts: u32,
    /// Base of the exponential retry backoff
    pub backoff: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: PRIORITY_NORMAL,
            delay: Duration::ZERO,
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}
