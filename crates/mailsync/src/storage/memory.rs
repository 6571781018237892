//! In-memory storage implementation
//!
//! Used by tests and simulations. Both traits are implemented on one struct
//! so a single `Arc` can be handed to every component.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use super::traits::{LocalId, MailStore, SyncStateStore, UniqueConstraintError};
use crate::models::{Email, Label, MessageId, SyncState};

struct StoredEmail {
    local_id: LocalId,
    email: Email,
}

/// In-memory implementation of [`MailStore`] and [`SyncStateStore`]
///
/// Uses maps protected by RwLocks for thread-safe access.
pub struct InMemoryMailStore {
    /// (user, remote id) -> stored item
    emails: RwLock<HashMap<(String, MessageId), StoredEmail>>,
    labels: RwLock<HashMap<String, Vec<Label>>>,
    sync_states: RwLock<BTreeMap<String, SyncState>>,
    next_id: AtomicI64,
}

impl InMemoryMailStore {
    pub fn new() -> Self {
        Self {
            emails: RwLock::new(HashMap::new()),
            labels: RwLock::new(HashMap::new()),
            sync_states: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> LocalId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryMailStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailStore for InMemoryMailStore {
    fn create_email(&self, user_id: &str, email: &Email) -> Result<LocalId> {
        let mut emails = self.emails.write().unwrap_or_else(|e| e.into_inner());
        let key = (user_id.to_string(), email.id.clone());
        if emails.contains_key(&key) {
            return Err(UniqueConstraintError {
                user_id: user_id.to_string(),
                message_id: email.id.clone(),
            }
            .into());
        }

        let local_id = self.allocate_id();
        emails.insert(
            key,
            StoredEmail {
                local_id,
                email: email.clone(),
            },
        );
        Ok(local_id)
    }

    fn upsert_email(&self, user_id: &str, email: &Email) -> Result<LocalId> {
        let mut emails = self.emails.write().unwrap_or_else(|e| e.into_inner());
        let key = (user_id.to_string(), email.id.clone());

        if let Some(stored) = emails.get_mut(&key) {
            stored.email = email.clone();
            return Ok(stored.local_id);
        }

        let local_id = self.allocate_id();
        emails.insert(
            key,
            StoredEmail {
                local_id,
                email: email.clone(),
            },
        );
        Ok(local_id)
    }

    fn delete_emails(&self, user_id: &str, ids: &[MessageId]) -> Result<usize> {
        let mut emails = self.emails.write().unwrap_or_else(|e| e.into_inner());
        let deleted = ids
            .iter()
            .filter(|id| emails.remove(&(user_id.to_string(), (*id).clone())).is_some())
            .count();
        Ok(deleted)
    }

    fn find_by_remote_id(&self, user_id: &str, id: &MessageId) -> Result<Option<Email>> {
        let emails = self.emails.read().unwrap_or_else(|e| e.into_inner());
        Ok(emails
            .get(&(user_id.to_string(), id.clone()))
            .map(|stored| stored.email.clone()))
    }

    fn find_local_ids(&self, user_id: &str, ids: &[MessageId]) -> Result<Vec<LocalId>> {
        let emails = self.emails.read().unwrap_or_else(|e| e.into_inner());
        Ok(ids
            .iter()
            .filter_map(|id| emails.get(&(user_id.to_string(), id.clone())))
            .map(|stored| stored.local_id)
            .collect())
    }

    fn count_emails(&self, user_id: &str) -> Result<u64> {
        let emails = self.emails.read().unwrap_or_else(|e| e.into_inner());
        Ok(emails.keys().filter(|(user, _)| user == user_id).count() as u64)
    }

    fn replace_labels(&self, user_id: &str, labels: &[Label]) -> Result<()> {
        self.labels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_string(), labels.to_vec());
        Ok(())
    }

    fn list_labels(&self, user_id: &str) -> Result<Vec<Label>> {
        let labels = self.labels.read().unwrap_or_else(|e| e.into_inner());
        Ok(labels.get(user_id).cloned().unwrap_or_default())
    }
}

impl SyncStateStore for InMemoryMailStore {
    fn get_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        let states = self.sync_states.read().unwrap_or_else(|e| e.into_inner());
        Ok(states.get(user_id).cloned())
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.sync_states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let states = self.sync_states.read().unwrap_or_else(|e| e.into_inner());
        Ok(states.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ThreadId;
    use crate::storage::is_unique_violation;

    fn email(id: &str, subject: &str) -> Email {
        Email::builder(MessageId::new(id), ThreadId::new("t1"))
            .subject(subject)
            .label_ids(["INBOX"])
            .build()
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let store = InMemoryMailStore::new();
        store.create_email("u", &email("m1", "a")).unwrap();

        let err = store.create_email("u", &email("m1", "b")).unwrap_err();
        assert!(is_unique_violation(&err));

        // Other users may hold the same remote id
        assert!(store.create_email("v", &email("m1", "a")).is_ok());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = InMemoryMailStore::new();
        let first = store.upsert_email("u", &email("m1", "a")).unwrap();
        let second = store.upsert_email("u", &email("m1", "b")).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count_emails("u").unwrap(), 1);
        let stored = store
            .find_by_remote_id("u", &MessageId::new("m1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.subject, "b");
    }

    #[test]
    fn test_delete_counts_only_existing() {
        let store = InMemoryMailStore::new();
        store.create_email("u", &email("m1", "a")).unwrap();
        store.create_email("u", &email("m2", "a")).unwrap();

        let ids = [MessageId::new("m1"), MessageId::new("missing")];
        let local = store.find_local_ids("u", &ids).unwrap();
        assert_eq!(local.len(), 1);

        assert_eq!(store.delete_emails("u", &ids).unwrap(), 1);
        assert_eq!(store.count_emails("u").unwrap(), 1);
    }

    #[test]
    fn test_sync_state_roundtrip() {
        let store = InMemoryMailStore::new();
        assert!(store.get_sync_state("u").unwrap().is_none());

        let mut state = store.load_or_default("u").unwrap();
        state.cursor = Some("42".into());
        store.save_sync_state(&state).unwrap();

        let loaded = store.get_sync_state("u").unwrap().unwrap();
        assert_eq!(loaded.cursor.as_deref(), Some("42"));
        assert_eq!(store.list_sync_states().unwrap().len(), 1);
    }
}
