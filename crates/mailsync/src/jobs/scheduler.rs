//! Decides which sync job a user needs and puts it on the queue

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use super::{
    CURSOR_CHECK_KEY, JobId, JobOptions, JobQueue, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL,
    SyncJob,
};
use crate::config::SyncSettings;
use crate::context::SyncLog;
use crate::storage::SyncStateStore;

/// Repeating-schedule key of a user's recurring incremental sync
pub fn recurring_key(user_id: &str) -> String {
    format!("recurring:{user_id}")
}

#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    states: Arc<dyn SyncStateStore>,
    recurring_interval: Duration,
    cursor_check_interval: Duration,
    log: SyncLog,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        states: Arc<dyn SyncStateStore>,
        settings: &SyncSettings,
        log: &SyncLog,
    ) -> Self {
        Self {
            queue,
            states,
            recurring_interval: Duration::from_secs(settings.worker.recurring_interval_secs),
            cursor_check_interval: Duration::from_secs(settings.cursor.check_interval_secs),
            log: log.with_target("mailsync::jobs::scheduler"),
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn schedule_full_sync(&self, user_id: &str, resume: bool, priority: u8) -> Result<JobId> {
        self.schedule(
            SyncJob::FullSync {
                user_id: user_id.to_string(),
                resume,
            },
            priority,
        )
    }

    pub fn schedule_incremental_sync(&self, user_id: &str, priority: u8) -> Result<JobId> {
        self.schedule(
            SyncJob::IncrementalSync {
                user_id: user_id.to_string(),
            },
            priority,
        )
    }

    pub fn schedule_metadata_sync(&self, user_id: &str, priority: u8) -> Result<JobId> {
        self.schedule(
            SyncJob::MetadataSync {
                user_id: user_id.to_string(),
            },
            priority,
        )
    }

    /// Pick the pass the user's stored state calls for
    ///
    /// Unconfigured users only get metadata; users without a completed full
    /// sync get one (resuming an interrupted run); everyone else gets a delta.
    pub fn schedule_auto_sync(&self, user_id: &str, priority: u8) -> Result<JobId> {
        let state = self.states.load_or_default(user_id)?;
        if !state.config.sync_configured {
            self.schedule_metadata_sync(user_id, priority)
        } else if !state.has_completed_full_sync() {
            self.schedule_full_sync(user_id, state.checkpoint.is_some(), priority)
        } else {
            self.schedule_incremental_sync(user_id, priority)
        }
    }

    /// User-initiated full sync; `None` when a pass is already running
    pub fn trigger_full_sync(&self, user_id: &str) -> Result<Option<JobId>> {
        if self.is_busy(user_id)? {
            return Ok(None);
        }
        self.schedule_full_sync(user_id, false, PRIORITY_HIGH)
            .map(Some)
    }

    /// User-initiated incremental sync; `None` when a pass is already running
    pub fn trigger_incremental_sync(&self, user_id: &str) -> Result<Option<JobId>> {
        if self.is_busy(user_id)? {
            return Ok(None);
        }
        self.schedule_incremental_sync(user_id, PRIORITY_HIGH)
            .map(Some)
    }

    /// User-initiated sync of whatever kind is due
    pub fn trigger_sync(&self, user_id: &str) -> Result<Option<JobId>> {
        if self.is_busy(user_id)? {
            return Ok(None);
        }
        self.schedule_auto_sync(user_id, PRIORITY_HIGH).map(Some)
    }

    /// Enable the recurring incremental sync and persist the choice
    pub fn start_recurring_sync(&self, user_id: &str) -> Result<()> {
        let mut state = self.states.load_or_default(user_id)?;
        let was_enabled = state.recurring_enabled;
        state.recurring_enabled = true;
        self.states.save_sync_state(&state)?;

        if let Err(e) = self.register_recurring(user_id) {
            state.recurring_enabled = was_enabled;
            if let Err(rollback) = self.states.save_sync_state(&state) {
                self.log.error(format_args!(
                    "Failed to roll back recurring flag for {}: {:#}",
                    user_id, rollback
                ));
            }
            return Err(e);
        }

        self.log.info(format_args!(
            "Recurring sync for {} every {}s",
            user_id,
            self.recurring_interval.as_secs()
        ));
        Ok(())
    }

    pub fn stop_recurring_sync(&self, user_id: &str) -> Result<()> {
        self.queue.remove_repeating(&recurring_key(user_id))?;
        let mut state = self.states.load_or_default(user_id)?;
        if state.recurring_enabled {
            state.recurring_enabled = false;
            self.states.save_sync_state(&state)?;
        }
        self.log
            .info(format_args!("Recurring sync stopped for {}", user_id));
        Ok(())
    }

    /// Re-register recurring syncs persisted by a previous process
    pub fn restore_recurring(&self) -> Result<usize> {
        let mut restored = 0;
        for state in self.states.list_sync_states()? {
            if !state.recurring_enabled {
                continue;
            }
            match self.register_recurring(&state.user_id) {
                Ok(()) => restored += 1,
                Err(e) => self.log.warn(format_args!(
                    "Failed to restore recurring sync for {}: {:#}",
                    state.user_id, e
                )),
            }
        }
        if restored > 0 {
            self.log
                .info(format_args!("Restored {} recurring syncs", restored));
        }
        Ok(restored)
    }

    /// Mark passes left `syncing` by a dead process as failed
    ///
    /// Call before the worker starts; otherwise triggers would skip these
    /// users forever.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut state in self.states.list_sync_states()? {
            if !state.is_syncing() {
                continue;
            }
            state.fail("sync interrupted by shutdown");
            self.states.save_sync_state(&state)?;
            self.log.warn(format_args!(
                "Recovered interrupted sync for {}",
                state.user_id
            ));
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Run the cursor expiry check on a fixed interval
    pub fn register_cursor_check(&self) -> Result<()> {
        self.queue.register_repeating(
            CURSOR_CHECK_KEY,
            SyncJob::CursorCheck,
            self.cursor_check_interval,
            SyncJob::CursorCheck
                .default_options()
                .with_priority(PRIORITY_LOW),
        )
    }

    fn register_recurring(&self, user_id: &str) -> Result<()> {
        let kind = SyncJob::IncrementalSync {
            user_id: user_id.to_string(),
        };
        let options = kind.default_options().with_priority(PRIORITY_NORMAL);
        self.queue
            .register_repeating(&recurring_key(user_id), kind, self.recurring_interval, options)
            .with_context(|| format!("Failed to register recurring sync for {user_id}"))
    }

    fn schedule(&self, kind: SyncJob, priority: u8) -> Result<JobId> {
        let options: JobOptions = kind.default_options().with_priority(priority);
        let name = kind.name();
        let user = kind.user_id().unwrap_or("-").to_string();
        let id = self
            .queue
            .enqueue(kind, options)
            .with_context(|| format!("Failed to enqueue {name} for {user}"))?;
        self.log.debug(format_args!(
            "Queued {} for {} as job {} (priority {})",
            name, user, id, priority
        ));
        Ok(id)
    }

    fn is_busy(&self, user_id: &str) -> Result<bool> {
        let busy = self
            .states
            .get_sync_state(user_id)?
            .is_some_and(|s| s.is_syncing());
        if busy {
            self.log
                .info(format_args!("Sync already running for {}, not queueing", user_id));
        }
        Ok(busy)
    }
}
