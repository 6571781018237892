//! Backing store for quota counters
//!
//! Counters are shared by every job acting for the same user, so they live
//! in an injected store rather than on any one limiter instance.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{QuotaCheck, Window, WindowLimit};

/// Storage for per-user, per-window quota counters
pub trait RateLimitStore: Send + Sync {
    /// Consume `cost` units from every window in `limits`, or from none
    ///
    /// The operation is allowed only when all windows have capacity. A denied
    /// check reports the longest time until a denying window resets.
    fn try_consume(
        &self,
        key: &str,
        limits: &[WindowLimit],
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<QuotaCheck>;

    /// Drop all counters for a key
    fn reset(&self, key: &str) -> Result<()>;
}

/// Counter for a single window
#[derive(Debug, Clone, Copy)]
struct Bucket {
    consumed: u32,
    reset_at: DateTime<Utc>,
}

impl Bucket {
    fn fresh(window: Window, now: DateTime<Utc>) -> Self {
        Self {
            consumed: 0,
            reset_at: now + window.length(),
        }
    }
}

/// Process-local rate limit store
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    buckets: Mutex<HashMap<(String, Window), Bucket>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn try_consume(
        &self,
        key: &str,
        limits: &[WindowLimit],
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<QuotaCheck> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let mut allowed = true;
        let mut wait_ms: u64 = 0;
        let mut remaining = u32::MAX;

        for limit in limits {
            let bucket = buckets
                .entry((key.to_string(), limit.window))
                .or_insert_with(|| Bucket::fresh(limit.window, now));
            if now >= bucket.reset_at {
                *bucket = Bucket::fresh(limit.window, now);
            }

            let available = limit.limit.saturating_sub(bucket.consumed);
            remaining = remaining.min(available);
            if cost > available {
                allowed = false;
                let until_reset = (bucket.reset_at - now).num_milliseconds().max(0) as u64;
                wait_ms = wait_ms.max(until_reset);
            }
        }

        if !allowed {
            return Ok(QuotaCheck {
                allowed,
                wait_ms,
                quota_remaining: remaining,
            });
        }

        let mut remaining = u32::MAX;
        for limit in limits {
            if let Some(bucket) = buckets.get_mut(&(key.to_string(), limit.window)) {
                bucket.consumed += cost;
                remaining = remaining.min(limit.limit.saturating_sub(bucket.consumed));
            }
        }

        Ok(QuotaCheck {
            allowed: true,
            wait_ms: 0,
            quota_remaining: remaining,
        })
    }

    fn reset(&self, key: &str) -> Result<()> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|(k, _), _| k != key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_second: u32, per_minute: u32) -> Vec<WindowLimit> {
        vec![
            WindowLimit::new(Window::Second, per_second),
            WindowLimit::new(Window::Minute, per_minute),
        ]
    }

    #[test]
    fn test_denied_window_does_not_consume_other() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let limits = limits(10, 12);

        assert!(store.try_consume("u", &limits, 10, now).unwrap().allowed);
        // Second window is full; the minute window must not be charged
        assert!(!store.try_consume("u", &limits, 2, now).unwrap().allowed);

        let later = now + chrono::Duration::milliseconds(1_001);
        let check = store.try_consume("u", &limits, 2, later).unwrap();
        assert!(check.allowed);
        assert_eq!(check.quota_remaining, 0);
    }

    #[test]
    fn test_wait_reports_longest_denying_window() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let limits = limits(100, 10);

        assert!(store.try_consume("u", &limits, 10, now).unwrap().allowed);
        let check = store.try_consume("u", &limits, 1, now).unwrap();
        assert!(!check.allowed);
        assert_eq!(check.wait_ms, 60_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let limits = limits(5, 100);

        assert!(store.try_consume("alice", &limits, 5, now).unwrap().allowed);
        assert!(store.try_consume("bob", &limits, 5, now).unwrap().allowed);

        store.reset("alice").unwrap();
        assert!(store.try_consume("alice", &limits, 5, now).unwrap().allowed);
        assert!(!store.try_consume("bob", &limits, 5, now).unwrap().allowed);
    }
}
