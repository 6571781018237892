//! Storage traits and implementations
//!
//! The sync engine writes items through [`MailStore`] and per-user progress
//! through [`SyncStateStore`]. Both backends implement both traits.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryMailStore;
pub use sqlite::SqliteMailStore;
pub use traits::{LocalId, MailStore, SyncStateStore, UniqueConstraintError, is_unique_violation};
