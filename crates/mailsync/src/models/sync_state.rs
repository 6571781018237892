//! Per-user sync state
//!
//! The single source of truth for status, cursor and full-sync checkpoint.
//! Updated read-modify-write at well-defined transition points: pass start,
//! page completion, success and failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a user's sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Idle,
        }
    }
}

/// Resumption marker for an in-progress full sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSyncCheckpoint {
    /// Next page to list; `None` before the first page completes
    pub page_token: Option<String>,
    /// Items processed so far
    pub progress: u64,
    pub started_at: DateTime<Utc>,
    /// Cursor captured when the fresh sync began
    pub cursor: Option<String>,
}

impl FullSyncCheckpoint {
    pub fn new(started_at: DateTime<Utc>, cursor: Option<String>) -> Self {
        Self {
            page_token: None,
            progress: 0,
            started_at,
            cursor,
        }
    }
}

/// User-selected sync scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Set once the user has chosen which labels to sync
    pub sync_configured: bool,
    /// Only items carrying at least one of these labels are synced (empty = all)
    pub sync_labels: Vec<String>,
    /// Items carrying any of these labels are never synced
    pub exclude_labels: Vec<String>,
    /// Ignore items older than this many days
    pub max_email_age_days: Option<u32>,
}

impl SyncConfig {
    pub fn labels(labels: &[&str]) -> Self {
        Self {
            sync_configured: true,
            sync_labels: labels.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Sync state for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: String,
    pub status: SyncStatus,
    /// Opaque delta-log position (Gmail historyId)
    pub cursor: Option<String>,
    pub cursor_set_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub checkpoint: Option<FullSyncCheckpoint>,
    #[serde(flatten)]
    pub config: SyncConfig,
    pub recurring_enabled: bool,
    pub email_count: u64,
    pub label_count: u64,
    pub contact_count: u64,
}

impl SyncState {
    /// Fresh state for a user that has never synced
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: SyncStatus::Idle,
            cursor: None,
            cursor_set_at: None,
            last_sync_at: None,
            last_full_sync_at: None,
            sync_error: None,
            checkpoint: None,
            config: SyncConfig::default(),
            recurring_enabled: false,
            email_count: 0,
            label_count: 0,
            contact_count: 0,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::Syncing
    }

    pub fn has_completed_full_sync(&self) -> bool {
        self.last_full_sync_at.is_some()
    }

    /// Transition to `syncing`, clearing any previous error
    pub fn begin(&mut self) {
        self.status = SyncStatus::Syncing;
        self.sync_error = None;
    }

    /// Transition to `idle` after a successful pass
    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = SyncStatus::Idle;
        self.sync_error = None;
        self.last_sync_at = Some(now);
    }

    /// Transition to `error`; the checkpoint is deliberately left untouched
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = SyncStatus::Error;
        self.sync_error = Some(message.into());
    }

    /// Store a new cursor and restart its expiry clock
    pub fn set_cursor(&mut self, cursor: impl Into<String>, now: DateTime<Utc>) {
        self.cursor = Some(cursor.into());
        self.cursor_set_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sync_state() {
        let state = SyncState::new("user-1");
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.cursor.is_none());
        assert!(!state.has_completed_full_sync());
        assert!(!state.config.sync_configured);
    }

    #[test]
    fn test_fail_keeps_checkpoint() {
        let now = Utc::now();
        let mut state = SyncState::new("user-1");
        state.begin();
        state.checkpoint = Some(FullSyncCheckpoint::new(now, Some("100".into())));
        state.fail("server error");

        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.sync_error.as_deref(), Some("server error"));
        assert!(state.checkpoint.is_some());
    }

    #[test]
    fn test_begin_clears_error() {
        let mut state = SyncState::new("user-1");
        state.fail("boom");
        state.begin();
        assert!(state.is_syncing());
        assert!(state.sync_error.is_none());
    }

    #[test]
    fn test_serialization_flattens_config() {
        let state = SyncState::new("user-1").with_config(SyncConfig::labels(&["INBOX"]));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["sync_configured"], true);
        assert_eq!(json["sync_labels"][0], "INBOX");

        let back: SyncState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
