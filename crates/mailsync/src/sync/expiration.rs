//! Cursor expiration
//!
//! Remote delta-log cursors are only honoured for a limited time after they
//! were issued. Pure functions here compute a cursor's age and remaining
//! lifetime; [`check_cursors`] turns that into per-user remediation.

use chrono::{DateTime, Utc};

use crate::config::CursorSettings;
use crate::models::SyncState;

/// Whole days since the cursor was stored
pub fn age_in_days(cursor_set_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - cursor_set_at).num_days()
}

/// Whole days left before expiry, never negative
pub fn days_until_expiration(cursor_set_at: DateTime<Utc>, now: DateTime<Utc>, ttl_days: i64) -> i64 {
    (ttl_days - age_in_days(cursor_set_at, now)).max(0)
}

pub fn is_expired(cursor_set_at: DateTime<Utc>, now: DateTime<Utc>, ttl_days: i64) -> bool {
    days_until_expiration(cursor_set_at, now, ttl_days) <= 0
}

/// True for ages in `[ttl - warning, ttl)`
pub fn is_expiring_soon(
    cursor_set_at: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl_days: i64,
    warning_days: i64,
) -> bool {
    !is_expired(cursor_set_at, now, ttl_days)
        && days_until_expiration(cursor_set_at, now, ttl_days) <= warning_days
}

/// Health of one user's cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorHealth {
    Healthy { days_left: i64 },
    ExpiringSoon { days_left: i64 },
    Expired,
}

pub fn cursor_health(
    cursor_set_at: DateTime<Utc>,
    now: DateTime<Utc>,
    settings: &CursorSettings,
) -> CursorHealth {
    let days_left = days_until_expiration(cursor_set_at, now, settings.ttl_days);
    if is_expired(cursor_set_at, now, settings.ttl_days) {
        CursorHealth::Expired
    } else if is_expiring_soon(cursor_set_at, now, settings.ttl_days, settings.warning_days) {
        CursorHealth::ExpiringSoon { days_left }
    } else {
        CursorHealth::Healthy { days_left }
    }
}

/// What the monitor wants done for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAction {
    /// Cursor already expired; run a full sync ahead of other work
    UrgentFullSync,
    /// Cursor about to expire; refresh it with a full sync
    ProactiveFullSync,
    /// Expiring (or expired without auto-remediation); log only
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorFinding {
    pub user_id: String,
    pub health: CursorHealth,
    pub action: CursorAction,
}

/// Inspect every user with a stored cursor
///
/// Users mid-sync are skipped; their pass will store a fresh cursor.
pub fn check_cursors(
    states: &[SyncState],
    now: DateTime<Utc>,
    settings: &CursorSettings,
) -> Vec<CursorFinding> {
    states
        .iter()
        .filter(|state| !state.is_syncing() && state.cursor.is_some())
        .filter_map(|state| {
            let set_at = state.cursor_set_at?;
            let health = cursor_health(set_at, now, settings);
            let action = match health {
                CursorHealth::Healthy { .. } => return None,
                CursorHealth::Expired if settings.auto_full_sync => CursorAction::UrgentFullSync,
                CursorHealth::ExpiringSoon { days_left }
                    if settings.auto_full_sync && days_left <= settings.proactive_days =>
                {
                    CursorAction::ProactiveFullSync
                }
                CursorHealth::Expired | CursorHealth::ExpiringSoon { .. } => CursorAction::Warn,
            };
            Some(CursorFinding {
                user_id: state.user_id.clone(),
                health,
                action,
            })
        })
        .collect()
}
