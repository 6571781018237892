//! Storage trait definitions

use anyhow::Result;

use crate::models::{Email, Label, MessageId, SyncState};

/// Locally assigned record id
pub type LocalId = i64;

/// Error returned by [`MailStore::create_email`] when the item already exists
///
/// Callers detect it with `err.downcast_ref::<UniqueConstraintError>()` and
/// fall back to an upsert.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Email {message_id} already exists for user {user_id}")]
pub struct UniqueConstraintError {
    pub user_id: String,
    pub message_id: MessageId,
}

/// Check whether an error chain carries a [`UniqueConstraintError`]
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<UniqueConstraintError>().is_some()
}

/// Repository for synced mailbox items
///
/// Every item is scoped to a user; `(user_id, email.id)` is unique.
pub trait MailStore: Send + Sync {
    /// Insert a new item, failing with [`UniqueConstraintError`] if present
    fn create_email(&self, user_id: &str, email: &Email) -> Result<LocalId>;

    /// Insert or replace an item, keeping its local id when it exists
    fn upsert_email(&self, user_id: &str, email: &Email) -> Result<LocalId>;

    /// Delete items by remote id, returning how many existed
    fn delete_emails(&self, user_id: &str, ids: &[MessageId]) -> Result<usize>;

    fn find_by_remote_id(&self, user_id: &str, id: &MessageId) -> Result<Option<Email>>;

    /// Local ids for the given remote ids; unknown ids are skipped
    fn find_local_ids(&self, user_id: &str, ids: &[MessageId]) -> Result<Vec<LocalId>>;

    fn count_emails(&self, user_id: &str) -> Result<u64>;

    /// Replace the user's label set
    fn replace_labels(&self, user_id: &str, labels: &[Label]) -> Result<()>;

    fn list_labels(&self, user_id: &str) -> Result<Vec<Label>>;
}

/// Persistence for per-user sync state
pub trait SyncStateStore: Send + Sync {
    fn get_sync_state(&self, user_id: &str) -> Result<Option<SyncState>>;

    /// Save sync state (upsert)
    fn save_sync_state(&self, state: &SyncState) -> Result<()>;

    fn list_sync_states(&self) -> Result<Vec<SyncState>>;

    /// Stored state, or a fresh one for users never seen before
    fn load_or_default(&self, user_id: &str) -> Result<SyncState> {
        Ok(self
            .get_sync_state(user_id)?
            .unwrap_or_else(|| SyncState::new(user_id)))
    }
}
