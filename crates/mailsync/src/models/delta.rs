//! Delta-log entries consumed by incremental sync

use serde::{Deserialize, Serialize};

use super::MessageId;

/// Kind of change recorded in the delta log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    Added,
    Deleted,
    LabelsAdded,
    LabelsRemoved,
}

/// One change from the remote delta log
///
/// Consumed once per incremental pass and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub kind: DeltaKind,
    pub message_id: MessageId,
    /// Delta-log position this change was recorded at
    pub position: Option<String>,
}

impl DeltaEntry {
    pub fn added(id: impl Into<MessageId>) -> Self {
        Self::new(DeltaKind::Added, id)
    }

    pub fn deleted(id: impl Into<MessageId>) -> Self {
        Self::new(DeltaKind::Deleted, id)
    }

    pub fn labels_added(id: impl Into<MessageId>) -> Self {
        Self::new(DeltaKind::LabelsAdded, id)
    }

    pub fn labels_removed(id: impl Into<MessageId>) -> Self {
        Self::new(DeltaKind::LabelsRemoved, id)
    }

    pub fn at(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    fn new(kind: DeltaKind, id: impl Into<MessageId>) -> Self {
        Self {
            kind,
            message_id: id.into(),
            position: None,
        }
    }
}
