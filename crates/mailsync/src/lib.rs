//! Mailsync - keeps a local mail store consistent with a remote mailbox
//!
//! This crate provides:
//! - Full (paginated, resumable) and incremental (delta-log) sync passes
//! - A rate-limited, retrying facade over the remote mailbox
//! - Cursor expiry monitoring with automatic full-sync remediation
//! - A priority job queue, scheduler and worker driving the passes
//! - Storage traits with in-memory and SQLite implementations
//! - A Gmail adapter for the remote mailbox
//!
//! The core is synchronous and executor-agnostic.

pub mod clock;
pub mod config;
pub mod context;
pub mod downstream;
pub mod engine;
pub mod error;
pub mod facade;
pub mod gmail;
pub mod jobs;
pub mod models;
pub mod ratelimit;
pub mod remote;
pub mod storage;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GmailCredentials, SyncSettings};
pub use context::{SyncContext, SyncLog};
pub use downstream::{DiscardEmbeddingQueue, EmbeddingQueue, InMemoryEmbeddingQueue};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use facade::{RemoteApi, backoff_delay, classify};
pub use gmail::{GmailClient, GmailMailboxProvider, OAuthTokenSource, TokenCache, TokenSource};
pub use jobs::{InMemoryJobQueue, Job, JobOptions, JobQueue, Scheduler, SyncJob, Worker};
pub use models::{
    DeltaEntry, DeltaKind, Email, EmailAddress, FullSyncCheckpoint, Label, LabelId, MessageId,
    SyncConfig, SyncState, SyncStatus, ThreadId,
};
pub use ratelimit::{InMemoryRateLimitStore, Operation, RateLimitStore, RateLimiter};
pub use remote::{InMemoryMailbox, MailboxProvider, RemoteError, RemoteMailbox};
pub use storage::{
    InMemoryMailStore, LocalId, MailStore, SqliteMailStore, SyncStateStore, UniqueConstraintError,
};
pub use sync::{
    CursorAction, CursorFinding, CursorHealth, FullSyncReport, IncrementalSyncReport,
    MetadataSyncReport, SyncProgress,
};
