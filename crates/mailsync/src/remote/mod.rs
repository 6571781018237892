//! Remote mailbox capability
//!
//! The sync engine talks to the remote mailbox only through
//! [`RemoteMailbox`]. Implementations return raw [`RemoteError`]s; the
//! facade classifies them.

mod memory;

pub use memory::InMemoryMailbox;

use std::sync::Arc;
use std::time::Duration;

use crate::models::{DeltaEntry, Email, Label, MessageId};

/// How a remote call failed, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The server answered with a non-success status
    Status {
        code: u16,
        /// Machine-readable reason (Google `errors[].reason`)
        reason: Option<String>,
        retry_after: Option<Duration>,
    },
    Timeout,
    Connection,
    /// The response could not be decoded
    Decode,
    Other,
}

/// Raw error from a remote call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub failure: TransportFailure,
    pub message: String,
}

impl RemoteError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            failure: TransportFailure::Status {
                code,
                reason: None,
                retry_after: None,
            },
            message: message.into(),
        }
    }

    pub fn status_with_reason(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            failure: TransportFailure::Status {
                code,
                reason: Some(reason.to_string()),
                retry_after: None,
            },
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            failure: TransportFailure::Status {
                code: 429,
                reason: Some("rateLimitExceeded".to_string()),
                retry_after,
            },
            message: "Too many requests".to_string(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            failure: TransportFailure::Timeout,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            failure: TransportFailure::Connection,
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            failure: TransportFailure::Decode,
            message: message.into(),
        }
    }
}

/// One page of item identifiers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemIdPage {
    pub ids: Vec<MessageId>,
    pub next_page_token: Option<String>,
}

/// One page of the delta log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaPage {
    pub entries: Vec<DeltaEntry>,
    pub next_page_token: Option<String>,
    /// Latest cursor reported by the remote
    pub new_cursor: Option<String>,
}

/// Operations the sync engine needs from a remote mailbox
pub trait RemoteMailbox: Send + Sync {
    /// List item ids matching `query`, one page at a time
    fn list_item_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ItemIdPage, RemoteError>;

    /// Fetch a full item
    fn get_item(&self, id: &MessageId) -> Result<Email, RemoteError>;

    fn list_labels(&self) -> Result<Vec<Label>, RemoteError>;

    /// Current position of the delta log
    fn get_current_cursor(&self) -> Result<String, RemoteError>;

    /// Delta-log entries recorded after `from_cursor`
    fn list_delta_log(
        &self,
        from_cursor: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<DeltaPage, RemoteError>;
}

/// Hands out a remote mailbox bound to one user's credentials
pub trait MailboxProvider: Send + Sync {
    fn mailbox(&self, user_id: &str) -> anyhow::Result<Arc<dyn RemoteMailbox>>;
}

/// Provider serving a fixed mailbox per user (tests, simulations)
#[derive(Default)]
pub struct StaticMailboxProvider {
    mailboxes: std::collections::HashMap<String, Arc<dyn RemoteMailbox>>,
}

impl StaticMailboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailbox(mut self, user_id: &str, mailbox: Arc<dyn RemoteMailbox>) -> Self {
        self.mailboxes.insert(user_id.to_string(), mailbox);
        self
    }
}

impl MailboxProvider for StaticMailboxProvider {
    fn mailbox(&self, user_id: &str) -> anyhow::Result<Arc<dyn RemoteMailbox>> {
        self.mailboxes
            .get(user_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No mailbox registered for user {}", user_id))
    }
}
