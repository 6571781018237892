//! Domain models for synced mail entities

mod delta;
mod label;
mod message;
mod sync_state;

pub use delta::{DeltaEntry, DeltaKind};
pub use label::{Label, LabelId};
pub use message::{Email, EmailAddress, EmailBuilder, MessageId, ThreadId};
pub use sync_state::{FullSyncCheckpoint, SyncConfig, SyncState, SyncStatus};
