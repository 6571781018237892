//! Quota-aware rate limiting
//!
//! Every remote operation has a fixed cost in quota units. Two windows are
//! enforced at once (per second and per minute) and an operation runs only
//! when both have room for its cost.

mod store;

pub use store::{InMemoryRateLimitStore, RateLimitStore};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RateLimitSettings;
use crate::error::{ErrorKind, SyncError, SyncResult};

/// Shortest sleep between quota polls
const MIN_POLL_DELAY: Duration = Duration::from_millis(100);

/// Remote operations and their quota-unit costs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    ListMessages,
    GetMessage,
    ListLabels,
    GetProfile,
    ListHistory,
}

impl Operation {
    /// Quota units charged per call (Gmail API cost table)
    pub fn cost(self) -> u32 {
        match self {
            Operation::ListMessages => 5,
            Operation::GetMessage => 5,
            Operation::ListLabels => 1,
            Operation::GetProfile => 1,
            Operation::ListHistory => 2,
        }
    }
}

/// A counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Second,
    Minute,
}

impl Window {
    pub fn length(self) -> chrono::Duration {
        match self {
            Window::Second => chrono::Duration::seconds(1),
            Window::Minute => chrono::Duration::minutes(1),
        }
    }
}

/// Capacity of one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub window: Window,
    pub limit: u32,
}

impl WindowLimit {
    pub fn new(window: Window, limit: u32) -> Self {
        Self { window, limit }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub allowed: bool,
    /// Suggested wait before retrying a denied check
    pub wait_ms: u64,
    /// Smallest remaining capacity across both windows
    pub quota_remaining: u32,
}

/// Per-user quota accounting over a shared counter store
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    limits: [WindowLimit; 2],
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        settings: &RateLimitSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            limits: [
                WindowLimit::new(Window::Second, settings.units_per_second),
                WindowLimit::new(Window::Minute, settings.units_per_minute),
            ],
            clock,
        }
    }

    /// Check (and if allowed, consume) quota for one operation
    pub fn check(&self, user_id: &str, operation: Operation) -> SyncResult<QuotaCheck> {
        self.store
            .try_consume(user_id, &self.limits, operation.cost(), self.clock.now())
            .map_err(|e| SyncError::new(ErrorKind::Unknown, format!("rate limit store: {e:#}")))
    }

    /// Block until quota for `operation` is available or `timeout` elapses
    ///
    /// Fails with a retryable `RateLimited` error on timeout.
    pub fn wait_for_quota(
        &self,
        user_id: &str,
        operation: Operation,
        timeout: Duration,
    ) -> SyncResult<()> {
        let started = self.clock.now();

        loop {
            let check = self.check(user_id, operation)?;
            if check.allowed {
                return Ok(());
            }

            let waited = (self.clock.now() - started).to_std().unwrap_or_default();
            if waited >= timeout {
                return Err(SyncError::rate_limit_timeout(waited)
                    .with_retry_after(Some(Duration::from_millis(check.wait_ms))));
            }

            let delay = Duration::from_millis(check.wait_ms).max(MIN_POLL_DELAY);
            self.clock.sleep(delay.min(timeout - waited).max(MIN_POLL_DELAY));
        }
    }
}
