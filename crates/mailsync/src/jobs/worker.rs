//! Job worker
//!
//! Reserves jobs from the queue and runs them through the [`SyncEngine`].
//! Only one pass per user runs at a time in this process; a job for a busy
//! user is put back with a delay.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{
    FailOutcome, Job, JobQueue, PRIORITY_HIGH, PRIORITY_NORMAL, PRIORITY_URGENT, Scheduler, SyncJob,
};
use crate::context::SyncLog;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::sync::{CursorAction, CursorFinding, SyncProgress};

/// How a processed job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// The cursor was unusable; a full sync was queued in its place
    Escalated,
    /// Another pass for the same user was running
    Postponed,
    Retrying { delay: Duration },
    Failed(SyncError),
}

#[derive(Clone, Default)]
struct ActiveUsers(Arc<Mutex<HashSet<String>>>);

impl ActiveUsers {
    fn claim(&self, user_id: &str) -> Option<UserGuard> {
        let mut users = self.0.lock().unwrap_or_else(|e| e.into_inner());
        users.insert(user_id.to_string()).then(|| UserGuard {
            users: self.clone(),
            user_id: user_id.to_string(),
        })
    }
}

struct UserGuard {
    users: ActiveUsers,
    user_id: String,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        self.users
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.user_id);
    }
}

pub struct Worker {
    engine: Arc<SyncEngine>,
    scheduler: Scheduler,
    active: ActiveUsers,
    log: SyncLog,
}

impl Worker {
    pub fn new(engine: Arc<SyncEngine>, scheduler: Scheduler) -> Self {
        let log = engine.log().with_target("mailsync::jobs::worker");
        Self {
            engine,
            scheduler,
            active: ActiveUsers::default(),
            log,
        }
    }

    fn queue(&self) -> &Arc<dyn JobQueue> {
        self.scheduler.queue()
    }

    /// Reserve and run one job, waiting up to `timeout` for it
    pub fn process_next(&self, timeout: Duration) -> Result<Option<(Job, JobOutcome)>> {
        let Some(job) = self.queue().reserve(timeout)? else {
            return Ok(None);
        };
        let outcome = self.process_job(&job)?;
        Ok(Some((job, outcome)))
    }

    /// Run every job that is ready now, including follow-ups they queue
    pub fn drain(&self) -> Result<Vec<(Job, JobOutcome)>> {
        let mut processed = Vec::new();
        while let Some(done) = self.process_next(Duration::ZERO)? {
            processed.push(done);
        }
        Ok(processed)
    }

    /// Run a reserved job and settle it on the queue
    pub fn process_job(&self, job: &Job) -> Result<JobOutcome> {
        let _guard = match job.kind.user_id() {
            Some(user_id) => match self.active.claim(user_id) {
                Some(guard) => Some(guard),
                None => {
                    let delay =
                        Duration::from_millis(self.engine.settings().worker.busy_user_delay_ms);
                    self.log.debug(format_args!(
                        "{} busy, postponing {} job {} by {}ms",
                        user_id,
                        job.kind.name(),
                        job.id,
                        delay.as_millis()
                    ));
                    self.queue().postpone(job.id, delay)?;
                    return Ok(JobOutcome::Postponed);
                }
            },
            None => None,
        };

        let started = Instant::now();
        self.log.info(format_args!(
            "Starting {} job {} (attempt {}/{})",
            job.kind.name(),
            job.id,
            job.attempts_made,
            job.options.attempts
        ));

        let err = match self.run(job) {
            Ok(()) => {
                self.queue().complete(job.id)?;
                self.log.info(format_args!(
                    "Finished {} job {} in {}ms",
                    job.kind.name(),
                    job.id,
                    started.elapsed().as_millis()
                ));
                return Ok(JobOutcome::Completed);
            }
            Err(err) => err,
        };

        if err.requires_full_sync()
            && let Some(user_id) = job.kind.user_id()
        {
            self.log.warn(format_args!(
                "{} job {} needs a full sync: {}",
                job.kind.name(),
                job.id,
                err
            ));
            let resume = self.has_checkpoint(user_id)?;
            self.scheduler
                .schedule_full_sync(user_id, resume, PRIORITY_URGENT)?;
            self.queue().complete(job.id)?;
            return Ok(JobOutcome::Escalated);
        }

        match self.queue().fail(job.id, &err)? {
            FailOutcome::Retrying { delay } => {
                self.log.warn(format_args!(
                    "{} job {} failed, retrying in {}ms: {}",
                    job.kind.name(),
                    job.id,
                    delay.as_millis(),
                    err
                ));
                Ok(JobOutcome::Retrying { delay })
            }
            FailOutcome::Failed => {
                self.log.error(format_args!(
                    "{} job {} failed after {} attempts: {}",
                    job.kind.name(),
                    job.id,
                    job.attempts_made,
                    err
                ));
                Ok(JobOutcome::Failed(err))
            }
        }
    }

    fn run(&self, job: &Job) -> SyncResult<()> {
        let queue = self.queue();
        let mut on_progress = |progress: &SyncProgress| {
            if let Err(e) = queue.report_progress(job.id, progress) {
                self.log
                    .debug(format_args!("Dropped progress for job {}: {:#}", job.id, e));
            }
        };

        match &job.kind {
            SyncJob::FullSync { user_id, resume } => {
                // A retried full sync picks up its own checkpoint
                let resume = *resume || job.attempts_made > 1;
                self.engine.full_sync(user_id, resume, &mut on_progress)?;
            }
            SyncJob::IncrementalSync { user_id } => {
                let report = self.engine.incremental_sync(user_id, &mut on_progress)?;
                if report.has_more {
                    self.scheduler
                        .schedule_incremental_sync(user_id, PRIORITY_HIGH)?;
                }
            }
            SyncJob::MetadataSync { user_id } => {
                self.engine.metadata_sync(user_id)?;
            }
            SyncJob::CursorCheck => {
                let findings = self.engine.check_cursors()?;
                self.remediate(&findings)?;
            }
        }
        Ok(())
    }

    /// An interrupted full sync left progress worth resuming
    fn has_checkpoint(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .engine
            .states()
            .get_sync_state(user_id)?
            .is_some_and(|state| state.checkpoint.is_some()))
    }

    fn remediate(&self, findings: &[CursorFinding]) -> Result<()> {
        for finding in findings {
            match finding.action {
                CursorAction::UrgentFullSync => {
                    self.log.warn(format_args!(
                        "Cursor for {} expired, queueing full sync",
                        finding.user_id
                    ));
                    let resume = self.has_checkpoint(&finding.user_id)?;
                    self.scheduler
                        .schedule_full_sync(&finding.user_id, resume, PRIORITY_URGENT)?;
                }
                CursorAction::ProactiveFullSync => {
                    self.log.info(format_args!(
                        "Cursor for {} expiring ({:?}), refreshing with a full sync",
                        finding.user_id, finding.health
                    ));
                    self.scheduler
                        .schedule_full_sync(&finding.user_id, false, PRIORITY_NORMAL)?;
                }
                CursorAction::Warn => self.log.warn(format_args!(
                    "Cursor for {} needs attention: {:?}",
                    finding.user_id, finding.health
                )),
            }
        }
        Ok(())
    }

    /// Spawn `worker.concurrency` threads polling the queue
    pub fn start(self: Arc<Self>) -> Result<WorkerHandle> {
        let settings = &self.engine.settings().worker;
        let poll = Duration::from_millis(settings.poll_interval_ms.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(settings.concurrency.max(1));
        for i in 0..settings.concurrency.max(1) {
            let worker = self.clone();
            let stop = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("mailsync-worker-{i}"))
                .spawn(move || worker.poll_loop(&stop, poll))
                .context("Failed to spawn worker thread")?;
            threads.push(handle);
        }
        self.log
            .info(format_args!("Started {} worker threads", threads.len()));
        Ok(WorkerHandle { stop, threads })
    }

    fn poll_loop(&self, stop: &AtomicBool, poll: Duration) {
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.process_next(poll) {
                self.log.error(format_args!("Worker error: {:#}", e));
                thread::sleep(poll);
            }
        }
    }
}

/// Running worker threads
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Let in-flight jobs finish, then join every thread
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join();
    }

    pub fn join(self) {
        for thread in self.threads {
            if thread.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::SyncSettings;
    use crate::jobs::{InMemoryJobQueue, JobOptions, JobStatus};
    use crate::models::{Email, FullSyncCheckpoint, MessageId, SyncConfig, SyncState, ThreadId};
    use crate::ratelimit::Operation;
    use crate::remote::{InMemoryMailbox, RemoteError, StaticMailboxProvider};
    use crate::storage::{InMemoryMailStore, MailStore, SyncStateStore};
    use chrono::Utc;

    struct Harness {
        worker: Worker,
        queue: Arc<InMemoryJobQueue>,
        scheduler: Scheduler,
        mailbox: Arc<InMemoryMailbox>,
        store: Arc<InMemoryMailStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mailbox = Arc::new(InMemoryMailbox::new());
        let store = Arc::new(InMemoryMailStore::new());
        let settings = SyncSettings::default();
        let engine = Arc::new(
            SyncEngine::builder(
                Arc::new(StaticMailboxProvider::new().with_mailbox("alice", mailbox.clone())),
                store.clone(),
                store.clone(),
            )
            .settings(settings.clone())
            .clock(clock.clone())
            .build(),
        );
        let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
        let scheduler = Scheduler::new(queue.clone(), store.clone(), &settings, engine.log());
        Harness {
            worker: Worker::new(engine, scheduler.clone()),
            queue,
            scheduler,
            mailbox,
            store,
            clock,
        }
    }

    fn email(id: &str) -> Email {
        Email::builder(MessageId::new(id), ThreadId::new(format!("t-{id}")))
            .subject(format!("subject {id}"))
            .label_ids(["INBOX"])
            .received_at(Utc::now())
            .build()
    }

    fn configure(store: &InMemoryMailStore) {
        store
            .save_sync_state(&SyncState::new("alice").with_config(SyncConfig::labels(&[])))
            .unwrap();
    }

    #[test]
    fn test_auto_sync_runs_full_sync_then_incremental() {
        let h = harness();
        configure(&h.store);
        h.mailbox.seed((0..3).map(|i| email(&format!("m{i}"))));

        h.scheduler.trigger_sync("alice").unwrap().unwrap();
        let done = h.worker.drain().unwrap();
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].0.kind, SyncJob::FullSync { .. }));
        assert_eq!(done[0].1, JobOutcome::Completed);
        assert_eq!(h.store.count_emails("alice").unwrap(), 3);

        h.mailbox.deliver(email("m9"));
        h.scheduler.trigger_sync("alice").unwrap().unwrap();
        let done = h.worker.drain().unwrap();
        assert!(matches!(done[0].0.kind, SyncJob::IncrementalSync { .. }));
        assert_eq!(h.store.count_emails("alice").unwrap(), 4);
    }

    #[test]
    fn test_missing_cursor_escalates_to_full_sync() {
        let h = harness();
        configure(&h.store);
        h.mailbox.seed([email("m1")]);

        h.scheduler
            .schedule_incremental_sync("alice", PRIORITY_NORMAL)
            .unwrap();
        let done = h.worker.drain().unwrap();

        assert_eq!(done.len(), 2);
        assert_eq!(done[0].1, JobOutcome::Escalated);
        assert_eq!(
            done[1].0.kind,
            SyncJob::FullSync {
                user_id: "alice".into(),
                resume: false
            }
        );
        assert_eq!(done[1].0.options.priority, PRIORITY_URGENT);
        assert_eq!(h.store.count_emails("alice").unwrap(), 1);
    }

    #[test]
    fn test_escalation_resumes_interrupted_full_sync() {
        let h = harness();
        h.mailbox.seed((0..3).map(|i| email(&format!("m{i}"))));
        let now = h.clock.now();
        let mut state = SyncState::new("alice").with_config(SyncConfig::labels(&[]));
        state.last_full_sync_at = Some(now);
        state.set_cursor("1", now);
        state.checkpoint = Some(FullSyncCheckpoint::new(now, Some("1".into())));
        h.store.save_sync_state(&state).unwrap();
        h.mailbox.expire_history();

        h.scheduler
            .schedule_incremental_sync("alice", PRIORITY_NORMAL)
            .unwrap();
        let done = h.worker.drain().unwrap();

        assert_eq!(done[0].1, JobOutcome::Escalated);
        assert_eq!(
            done[1].0.kind,
            SyncJob::FullSync {
                user_id: "alice".into(),
                resume: true
            }
        );
        assert_eq!(done[1].1, JobOutcome::Completed);
        assert_eq!(h.store.count_emails("alice").unwrap(), 3);
    }

    #[test]
    fn test_busy_user_is_postponed() {
        let h = harness();
        let id = h
            .queue
            .enqueue(
                SyncJob::MetadataSync {
                    user_id: "alice".into(),
                },
                JobOptions::default(),
            )
            .unwrap();
        let job = h.queue.reserve(Duration::ZERO).unwrap().unwrap();

        let _held = h.worker.active.claim("alice").unwrap();
        assert_eq!(h.worker.process_job(&job).unwrap(), JobOutcome::Postponed);
        assert_eq!(h.queue.status(id), Some(JobStatus::Waiting));
        assert!(h.queue.reserve(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_retryable_failure_is_requeued() {
        let h = harness();
        // Outlasts the facade's own retries so the job attempt fails
        for _ in 0..10 {
            h.mailbox
                .fail_call(Operation::ListLabels, 0, RemoteError::status(503, "backend"));
        }

        let start = h.clock.now();
        h.scheduler
            .schedule_metadata_sync("alice", PRIORITY_NORMAL)
            .unwrap();
        let (job, outcome) = h.worker.process_next(Duration::ZERO).unwrap().unwrap();

        assert!(matches!(outcome, JobOutcome::Retrying { .. }));
        assert_eq!(h.queue.status(job.id), Some(JobStatus::Waiting));
        assert!(h.clock.now() > start);
        let state = h.store.get_sync_state("alice").unwrap().unwrap();
        assert!(state.sync_error.is_some());
    }

    #[test]
    fn test_cursor_check_queues_full_sync_for_expired_cursor() {
        let h = harness();
        let mut state = SyncState::new("alice").with_config(SyncConfig::labels(&[]));
        state.last_full_sync_at = Some(h.clock.now());
        state.set_cursor("1", h.clock.now());
        h.store.save_sync_state(&state).unwrap();
        h.clock.advance(Duration::from_secs(31 * 24 * 60 * 60));

        h.queue
            .enqueue(SyncJob::CursorCheck, SyncJob::CursorCheck.default_options())
            .unwrap();
        let (_, outcome) = h.worker.process_next(Duration::ZERO).unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let waiting = h.queue.waiting();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].0.options.priority, PRIORITY_URGENT);
        assert!(matches!(waiting[0].0.kind, SyncJob::FullSync { .. }));
    }
}
