//! Remote API facade
//!
//! Wraps every remote call with a pre-flight quota wait, bounded retries with
//! exponential backoff, and one-time error classification.

use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncSettings;
use crate::context::SyncContext;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::models::{Email, Label, MessageId};
use crate::ratelimit::{Operation, RateLimiter};
use crate::remote::{DeltaPage, ItemIdPage, RemoteError, RemoteMailbox, TransportFailure};

/// Retry ceiling and delay cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Delay before retrying after failed attempt number `attempt` (1-based)
///
/// `min(base * 2^(attempt-1), cap)`
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Map a raw transport error onto the sync error taxonomy
pub fn classify(err: &RemoteError) -> SyncError {
    let (kind, retry_after) = match &err.failure {
        TransportFailure::Timeout => (ErrorKind::Timeout, None),
        TransportFailure::Connection => (ErrorKind::NetworkError, None),
        TransportFailure::Decode => (ErrorKind::ServerError, None),
        TransportFailure::Other => (ErrorKind::Unknown, None),
        TransportFailure::Status {
            code,
            reason,
            retry_after,
        } => (classify_status(*code, reason.as_deref()), *retry_after),
    };
    SyncError::new(kind, err.message.clone()).with_retry_after(retry_after)
}

fn classify_status(code: u16, reason: Option<&str>) -> ErrorKind {
    let quota_reason = matches!(reason, Some("quotaExceeded" | "dailyLimitExceeded"));
    let rate_reason = matches!(reason, Some("rateLimitExceeded" | "userRateLimitExceeded"));

    match code {
        401 => ErrorKind::Unauthorized,
        429 if quota_reason => ErrorKind::QuotaExceeded,
        429 => ErrorKind::RateLimited,
        403 if quota_reason => ErrorKind::QuotaExceeded,
        403 if rate_reason => ErrorKind::RateLimited,
        403 => ErrorKind::InsufficientPermission,
        400 | 409 | 412 => ErrorKind::InvalidRequest,
        404 | 410 => ErrorKind::NotFound,
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    }
}

/// Rate-limited, retrying view of one user's remote mailbox
pub struct RemoteApi {
    remote: Arc<dyn RemoteMailbox>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    quota_timeout: Duration,
    ctx: SyncContext,
}

impl RemoteApi {
    pub fn new(
        remote: Arc<dyn RemoteMailbox>,
        limiter: Arc<RateLimiter>,
        settings: &SyncSettings,
        ctx: SyncContext,
    ) -> Self {
        Self {
            remote,
            limiter,
            policy: RetryPolicy {
                max_attempts: settings.retry.max_attempts.max(1),
                max_delay: Duration::from_millis(settings.retry.max_delay_ms),
            },
            quota_timeout: settings.rate_limit.wait_timeout(),
            ctx,
        }
    }

    pub fn list_item_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> SyncResult<ItemIdPage> {
        self.call(Operation::ListMessages, || {
            self.remote.list_item_ids(query, page_token, page_size)
        })
    }

    pub fn get_item(&self, id: &MessageId) -> SyncResult<Email> {
        self.call(Operation::GetMessage, || self.remote.get_item(id))
    }

    pub fn list_labels(&self) -> SyncResult<Vec<Label>> {
        self.call(Operation::ListLabels, || self.remote.list_labels())
    }

    pub fn get_current_cursor(&self) -> SyncResult<String> {
        self.call(Operation::GetProfile, || self.remote.get_current_cursor())
    }

    pub fn list_delta_log(
        &self,
        from_cursor: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> SyncResult<DeltaPage> {
        self.call(Operation::ListHistory, || {
            self.remote.list_delta_log(from_cursor, page_token, max_results)
        })
    }

    /// Fetch full items with at most `concurrency` requests in flight
    ///
    /// Results come back in the order of `ids`; one failure never affects
    /// the others.
    pub fn get_items(
        &self,
        ids: &[MessageId],
        concurrency: usize,
    ) -> Vec<(MessageId, SyncResult<Email>)> {
        let fetch = |id: &MessageId| (id.clone(), self.get_item(id));

        if ids.len() <= 1 || concurrency <= 1 {
            return ids.iter().map(fetch).collect();
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.min(ids.len()))
            .thread_name(|i| format!("mailsync-fetch-{i}"))
            .build()
        {
            Ok(pool) => pool.install(|| ids.par_iter().map(fetch).collect()),
            Err(e) => {
                self.ctx.log.warn(format_args!(
                    "Failed to build fetch pool ({}), fetching sequentially",
                    e
                ));
                ids.iter().map(fetch).collect()
            }
        }
    }

    fn call<T>(
        &self,
        operation: Operation,
        request: impl Fn() -> Result<T, RemoteError>,
    ) -> SyncResult<T> {
        let mut attempt = 1;
        loop {
            let outcome = self
                .limiter
                .wait_for_quota(&self.ctx.user_id, operation, self.quota_timeout)
                .and_then(|()| request().map_err(|e| classify(&e)));

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(err);
            }

            let base = err
                .retry_after()
                .unwrap_or_else(|| err.kind().default_retry_delay());
            let delay = backoff_delay(attempt, base, self.policy.max_delay);
            self.ctx.log.debug(format_args!(
                "{:?} attempt {}/{} failed ({}), retrying in {}ms",
                operation,
                attempt,
                self.policy.max_attempts,
                err,
                delay.as_millis()
            ));
            self.ctx.clock.sleep(delay);
            attempt += 1;
        }
    }
}
