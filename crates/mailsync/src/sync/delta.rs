//! Delta-log categorization
//!
//! Folds delta entries, in log order, into three disjoint id sets so each
//! item is fetched or deleted at most once per pass. The latest change wins.

use std::collections::BTreeSet;

use crate::models::{DeltaEntry, DeltaKind, MessageId};

/// Work derived from a run of delta entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSet {
    pub to_add: BTreeSet<MessageId>,
    pub to_delete: BTreeSet<MessageId>,
    pub to_update: BTreeSet<MessageId>,
}

impl DeltaSet {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_delete.len() + self.to_update.len()
    }
}

/// Categorize entries in log order
pub fn categorize<'a>(entries: impl IntoIterator<Item = &'a DeltaEntry>) -> DeltaSet {
    let mut set = DeltaSet::default();

    for entry in entries {
        let id = &entry.message_id;
        match entry.kind {
            DeltaKind::Added => {
                set.to_delete.remove(id);
                // A full fetch already picks up the latest labels
                set.to_update.remove(id);
                set.to_add.insert(id.clone());
            }
            DeltaKind::Deleted => {
                set.to_add.remove(id);
                set.to_update.remove(id);
                set.to_delete.insert(id.clone());
            }
            DeltaKind::LabelsAdded | DeltaKind::LabelsRemoved => {
                if !set.to_add.contains(id) && !set.to_delete.contains(id) {
                    set.to_update.insert(id.clone());
                }
            }
        }
    }

    set
}
