//! Priority job queue with delayed, retried and repeating jobs

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{JobOptions, SyncJob};
use crate::clock::Clock;
use crate::error::SyncError;
use crate::facade::backoff_delay;
use crate::sync::SyncProgress;

pub type JobId = u64;

/// Longest delay between two attempts of one job
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// A reserved unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub kind: SyncJob,
    pub options: JobOptions,
    /// Attempts started so far, including the current one
    pub attempts_made: u32,
}

/// What happened to a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Failed,
}

/// Queue the scheduler feeds and the worker drains
pub trait JobQueue: Send + Sync {
    /// Add a job; a waiting job with the same dedupe key absorbs it
    fn enqueue(&self, kind: SyncJob, options: JobOptions) -> Result<JobId>;

    /// Enqueue `kind` every `every`, replacing any schedule under `key`
    fn register_repeating(
        &self,
        key: &str,
        kind: SyncJob,
        every: Duration,
        options: JobOptions,
    ) -> Result<()>;

    /// Returns whether a schedule was removed
    fn remove_repeating(&self, key: &str) -> Result<bool>;

    fn repeating_keys(&self) -> Vec<String>;

    /// Block up to `timeout` for the next ready job
    fn reserve(&self, timeout: Duration) -> Result<Option<Job>>;

    fn complete(&self, id: JobId) -> Result<()>;

    /// Record a failed attempt; retryable errors are re-queued with backoff
    fn fail(&self, id: JobId, err: &SyncError) -> Result<FailOutcome>;

    /// Put an active job back without consuming an attempt
    fn postpone(&self, id: JobId, delay: Duration) -> Result<()>;

    fn report_progress(&self, id: JobId, progress: &SyncProgress) -> Result<()>;

    fn progress(&self, id: JobId) -> Option<SyncProgress>;

    fn status(&self, id: JobId) -> Option<JobStatus>;

    /// Wake blocked reservers and refuse further work
    fn close(&self);
}

struct Entry {
    job: Job,
    run_at: DateTime<Utc>,
}

struct Repeating {
    kind: SyncJob,
    every: Duration,
    options: JobOptions,
    next_run: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    next_id: JobId,
    waiting: BTreeMap<JobId, Entry>,
    active: HashMap<JobId, Job>,
    finished: VecDeque<(JobId, JobStatus)>,
    repeating: BTreeMap<String, Repeating>,
    progress: HashMap<JobId, SyncProgress>,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, kind: SyncJob, options: JobOptions, now: DateTime<Utc>) -> JobId {
        let key = kind.dedupe_key();
        if let Some(entry) = self
            .waiting
            .values_mut()
            .find(|e| e.job.kind.dedupe_key() == key)
        {
            // Keep the more urgent of the two
            if options.priority < entry.job.options.priority {
                entry.job.options.priority = options.priority;
                entry.run_at = entry.run_at.min(now + to_chrono(options.delay));
            }
            return entry.job.id;
        }

        self.next_id += 1;
        let id = self.next_id;
        let run_at = now + to_chrono(options.delay);
        self.waiting.insert(
            id,
            Entry {
                job: Job {
                    id,
                    kind,
                    options,
                    attempts_made: 0,
                },
                run_at,
            },
        );
        id
    }

    /// Materialize repeating schedules that have come due
    fn fire_repeating(&mut self, now: DateTime<Utc>) {
        let due: Vec<(SyncJob, JobOptions)> = self
            .repeating
            .values_mut()
            .filter(|r| r.next_run <= now)
            .map(|r| {
                // Missed runs collapse into one
                r.next_run = now + to_chrono(r.every);
                (r.kind.clone(), r.options.clone())
            })
            .collect();
        for (kind, options) in due {
            self.push(kind, options, now);
        }
    }

    fn next_ready(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.waiting
            .values()
            .filter(|e| e.run_at <= now)
            .min_by_key(|e| (e.job.options.priority, e.run_at, e.job.id))
            .map(|e| e.job.id)
    }

    /// Time until the earliest waiting job or repeating schedule is due
    fn next_due_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.waiting
            .values()
            .map(|e| e.run_at)
            .chain(self.repeating.values().map(|r| r.next_run))
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    fn finish(&mut self, id: JobId, status: JobStatus, retention: usize) {
        self.progress.remove(&id);
        self.finished.push_back((id, status));
        while self.finished.len() > retention {
            self.finished.pop_front();
        }
    }

    fn take_active(&mut self, id: JobId) -> Result<Job> {
        match self.active.remove(&id) {
            Some(job) => Ok(job),
            None => bail!("Job {} is not active", id),
        }
    }
}

/// In-process [`JobQueue`]
///
/// Due times are read from the injected [`Clock`]; blocking in `reserve` is
/// real time, capped at the next due time so delayed jobs are picked up.
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    clock: Arc<dyn Clock>,
    retention: usize,
}

impl InMemoryJobQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            clock,
            retention: 100,
        }
    }

    /// Number of finished jobs whose status stays queryable
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Jobs waiting to run, in id order
    pub fn waiting(&self) -> Vec<(Job, DateTime<Utc>)> {
        self.lock()
            .waiting
            .values()
            .map(|e| (e.job.clone(), e.run_at))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, kind: SyncJob, options: JobOptions) -> Result<JobId> {
        let mut state = self.lock();
        if state.closed {
            bail!("Job queue is closed");
        }
        let id = state.push(kind, options, self.clock.now());
        drop(state);
        self.ready.notify_one();
        Ok(id)
    }

    fn register_repeating(
        &self,
        key: &str,
        kind: SyncJob,
        every: Duration,
        options: JobOptions,
    ) -> Result<()> {
        if every.is_zero() {
            bail!("Repeating job {} needs a non-zero interval", key);
        }
        let mut state = self.lock();
        if state.closed {
            bail!("Job queue is closed");
        }
        let next_run = self.clock.now() + to_chrono(every);
        state.repeating.insert(
            key.to_string(),
            Repeating {
                kind,
                every,
                options,
                next_run,
            },
        );
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn remove_repeating(&self, key: &str) -> Result<bool> {
        Ok(self.lock().repeating.remove(key).is_some())
    }

    fn repeating_keys(&self) -> Vec<String> {
        self.lock().repeating.keys().cloned().collect()
    }

    fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if state.closed {
                return Ok(None);
            }
            let now = self.clock.now();
            state.fire_repeating(now);

            if let Some(id) = state.next_ready(now)
                && let Some(entry) = state.waiting.remove(&id)
            {
                let mut job = entry.job;
                job.attempts_made += 1;
                state.active.insert(id, job.clone());
                return Ok(Some(job));
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            let wait = state.next_due_in(now).map_or(left, |due| due.min(left));
            let (guard, _) = self
                .ready
                .wait_timeout(state, wait.max(Duration::from_millis(1)))
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    fn complete(&self, id: JobId) -> Result<()> {
        let mut state = self.lock();
        state.take_active(id)?;
        state.finish(id, JobStatus::Completed, self.retention);
        Ok(())
    }

    fn fail(&self, id: JobId, err: &SyncError) -> Result<FailOutcome> {
        let mut state = self.lock();
        let job = state.take_active(id)?;

        let retry = err.is_retryable()
            && !err.requires_full_sync()
            && job.attempts_made < job.options.attempts;
        if !retry {
            state.finish(id, JobStatus::Failed, self.retention);
            return Ok(FailOutcome::Failed);
        }

        let backoff = backoff_delay(job.attempts_made, job.options.backoff, MAX_RETRY_DELAY);
        let delay = err.retry_after().map_or(backoff, |after| after.max(backoff));
        let run_at = self.clock.now() + to_chrono(delay);
        state.waiting.insert(id, Entry { job, run_at });
        drop(state);
        self.ready.notify_one();
        Ok(FailOutcome::Retrying { delay })
    }

    fn postpone(&self, id: JobId, delay: Duration) -> Result<()> {
        let mut state = self.lock();
        let mut job = state.take_active(id)?;
        job.attempts_made = job.attempts_made.saturating_sub(1);
        let run_at = self.clock.now() + to_chrono(delay);
        state.waiting.insert(id, Entry { job, run_at });
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    fn report_progress(&self, id: JobId, progress: &SyncProgress) -> Result<()> {
        let mut state = self.lock();
        if !state.active.contains_key(&id) {
            bail!("Job {} is not active", id);
        }
        state.progress.insert(id, progress.clone());
        Ok(())
    }

    fn progress(&self, id: JobId) -> Option<SyncProgress> {
        self.lock().progress.get(&id).cloned()
    }

    fn status(&self, id: JobId) -> Option<JobStatus> {
        let state = self.lock();
        if state.waiting.contains_key(&id) {
            return Some(JobStatus::Waiting);
        }
        if state.active.contains_key(&id) {
            return Some(JobStatus::Active);
        }
        state
            .finished
            .iter()
            .rev()
            .find(|(finished, _)| *finished == id)
            .map(|(_, status)| *status)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
