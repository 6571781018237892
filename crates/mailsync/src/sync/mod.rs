//! Sync engine for fetching and storing mail
//!
//! Every pass is idempotent: items are written create-first with an upsert
//! fallback, so replays after a crash or a concurrent pass are harmless.

mod delta;
mod expiration;
mod filter;
mod full;
mod incremental;
mod metadata;

pub use delta::{DeltaSet, categorize};
pub use expiration::{
    CursorAction, CursorFinding, CursorHealth, age_in_days, check_cursors, cursor_health,
    days_until_expiration, is_expired, is_expiring_soon,
};
pub use filter::SyncFilter;
pub use full::{FullSyncOrchestrator, FullSyncReport, StopReason};
pub use incremental::{IncrementalSyncOrchestrator, IncrementalSyncReport};
pub use metadata::{MetadataSyncReport, sync_metadata};

use serde::Serialize;

use crate::context::SyncContext;
use crate::downstream::EmbeddingBatcher;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::facade::RemoteApi;
use crate::models::{Email, MessageId};
use crate::storage::{LocalId, MailStore, SyncStateStore, is_unique_violation};

/// Everything one pass touches
#[derive(Clone, Copy)]
pub struct SyncResources<'a> {
    pub api: &'a RemoteApi,
    pub store: &'a dyn MailStore,
    pub states: &'a dyn SyncStateStore,
    pub embeddings: &'a EmbeddingBatcher,
    pub ctx: &'a SyncContext,
}

/// Running totals reported while a pass is in flight
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub pages: u32,
    pub processed: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// An item that could not be synced; the pass carried on without it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub message_id: MessageId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    fn new(message_id: MessageId, err: &SyncError) -> Self {
        Self {
            message_id,
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

/// Result of writing one fetched item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stored {
    Created(LocalId),
    Updated(LocalId),
}

/// Create the item, falling back to an upsert if it already exists
pub(crate) fn store_item(store: &dyn MailStore, user_id: &str, email: &Email) -> SyncResult<Stored> {
    match store.create_email(user_id, email) {
        Ok(id) => Ok(Stored::Created(id)),
        Err(e) if is_unique_violation(&e) => Ok(Stored::Updated(store.upsert_email(user_id, email)?)),
        Err(e) => Err(e.into()),
    }
}

/// Record a failed item and carry on, unless the failure is account-wide
pub(crate) fn skip_item(
    ctx: &SyncContext,
    errors: &mut Vec<ItemError>,
    id: MessageId,
    err: SyncError,
) -> SyncResult<()> {
    if aborts_pass(&err) {
        return Err(err);
    }
    ctx.log.warn(format_args!("Skipping {}: {}", id, err));
    errors.push(ItemError::new(id, &err));
    Ok(())
}

/// Failures that affect the whole account rather than one item
///
/// Continuing past them would only record the same error for every item.
pub(crate) fn aborts_pass(err: &SyncError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Unauthorized | ErrorKind::RateLimited | ErrorKind::QuotaExceeded
    )
}
