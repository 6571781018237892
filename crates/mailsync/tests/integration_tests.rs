//! End-to-end sync scenarios against an in-memory remote mailbox

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Utc;
use mailsync::jobs::{JobOutcome, PRIORITY_URGENT};
use mailsync::remote::{DeltaPage, ItemIdPage, StaticMailboxProvider};
use mailsync::sync::StopReason;
use mailsync::{
    Email, ErrorKind, InMemoryEmbeddingQueue, InMemoryJobQueue, InMemoryMailStore,
    InMemoryMailbox, Label, LocalId, MailStore, ManualClock, MessageId, Operation, RemoteError,
    RemoteMailbox, Scheduler, SqliteMailStore, SyncConfig, SyncEngine, SyncEngineBuilder, SyncJob,
    SyncProgress, SyncSettings, SyncState, SyncStateStore, SyncStatus, ThreadId, Worker,
};

const USER: &str = "alice@example.com";

fn email(id: &str) -> Email {
    labelled(id, &["INBOX"])
}

fn labelled(id: &str, labels: &[&str]) -> Email {
    Email::builder(MessageId::new(id), ThreadId::new(format!("thread-{id}")))
        .subject(format!("Message {id}"))
        .snippet("hello")
        .label_ids(labels.iter().copied())
        .received_at(Utc::now())
        .build()
}

fn settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.full_sync.page_size = 100;
    settings.full_sync.max_items = Some(1_000);
    settings
}

fn build_engine<S>(
    mailbox: &Arc<InMemoryMailbox>,
    store: &Arc<S>,
    clock: &Arc<ManualClock>,
) -> SyncEngine
where
    S: MailStore + SyncStateStore + 'static,
{
    engine_builder(mailbox.clone(), store, clock, settings()).build()
}

fn engine_builder<S>(
    remote: Arc<dyn RemoteMailbox>,
    store: &Arc<S>,
    clock: &Arc<ManualClock>,
    settings: SyncSettings,
) -> SyncEngineBuilder
where
    S: MailStore + SyncStateStore + 'static,
{
    SyncEngine::builder(
        Arc::new(StaticMailboxProvider::new().with_mailbox(USER, remote)),
        store.clone(),
        store.clone(),
    )
    .settings(settings)
    .clock(clock.clone())
}

fn configure(states: &dyn SyncStateStore) {
    configure_with(states, SyncConfig::labels(&[]));
}

fn configure_with(states: &dyn SyncStateStore, config: SyncConfig) {
    states
        .save_sync_state(&SyncState::new(USER).with_config(config))
        .unwrap();
}

fn seeded_mailbox(count: usize) -> Arc<InMemoryMailbox> {
    let mailbox = Arc::new(InMemoryMailbox::new());
    mailbox.seed((0..count).map(|i| email(&format!("m{i:04}"))));
    mailbox
}

#[test]
fn test_full_sync_imports_every_page() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(250);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);

    let mut pages_seen = Vec::new();
    let report = engine
        .full_sync(USER, false, &mut |p: &SyncProgress| pages_seen.push(p.pages))
        .unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(report.added, 250);
    assert_eq!(report.updated, 0);
    assert!(report.errors.is_empty());
    assert_eq!(report.stop_reason, StopReason::Exhausted);
    assert_eq!(pages_seen, vec![1, 2, 3]);
    assert_eq!(store.count_emails(USER).unwrap(), 250);

    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Idle);
    assert!(state.checkpoint.is_none());
    assert_eq!(state.cursor.as_deref(), report.cursor.as_deref());
    assert!(state.last_full_sync_at.is_some());
    assert_eq!(state.email_count, 250);
}

#[test]
fn test_repeated_full_sync_is_idempotent() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(120);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);

    engine.full_sync(USER, false, &mut |_| {}).unwrap();
    let second = engine.full_sync(USER, false, &mut |_| {}).unwrap();

    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 120);
    assert_eq!(store.count_emails(USER).unwrap(), 120);
}

#[test]
fn test_full_sync_stops_at_item_cap() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(1_050);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);

    let report = engine.full_sync(USER, false, &mut |_| {}).unwrap();

    assert_eq!(report.pages, 10);
    assert_eq!(report.added, 1_000);
    assert_eq!(report.stop_reason, StopReason::MaxItems);
}

#[test]
fn test_failed_full_sync_resumes_from_checkpoint() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(250);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);

    // Third page listing is rejected outright
    mailbox.fail_call(
        Operation::ListMessages,
        2,
        RemoteError::status(400, "Invalid pageToken"),
    );
    let err = engine.full_sync(USER, false, &mut |_| {}).unwrap_err();
    assert!(!err.is_retryable());

    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Error);
    let checkpoint = state.checkpoint.expect("checkpoint kept after failure");
    assert_eq!(checkpoint.progress, 200);
    assert_eq!(store.count_emails(USER).unwrap(), 200);

    let report = engine.full_sync(USER, true, &mut |_| {}).unwrap();
    assert!(report.resumed);
    assert_eq!(report.pages, 1);
    assert_eq!(report.added, 50);
    assert_eq!(report.processed, 250);
    assert_eq!(store.count_emails(USER).unwrap(), 250);

    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert!(state.checkpoint.is_none());
    assert_eq!(state.status, SyncStatus::Idle);
}

#[test]
fn test_incremental_sync_applies_adds_and_deletes() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(10);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);
    engine.full_sync(USER, false, &mut |_| {}).unwrap();

    for i in 0..5 {
        mailbox.deliver(email(&format!("new{i}")));
    }
    mailbox.delete("m0000");
    mailbox.delete("m0001");

    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();
    assert_eq!(report.added, 5);
    assert_eq!(report.deleted, 2);
    assert_eq!(report.updated, 0);
    assert!(!report.has_more);
    assert_eq!(report.cursor.as_deref(), Some(mailbox.current_cursor().as_str()));
    assert_eq!(store.count_emails(USER).unwrap(), 13);

    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.cursor, Some(mailbox.current_cursor()));

    // Nothing new since the last pass
    let again = engine.incremental_sync(USER, &mut |_| {}).unwrap();
    assert_eq!(again.added + again.deleted + again.updated, 0);
}

#[test]
fn test_expired_cursor_escalates_to_full_sync() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(5);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let settings = settings();
    let engine = Arc::new(build_engine(&mailbox, &store, &clock));
    let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
    let scheduler = Scheduler::new(queue, store.clone(), &settings, engine.log());
    let worker = Worker::new(engine, scheduler.clone());

    scheduler.trigger_sync(USER).unwrap().unwrap();
    worker.drain().unwrap();
    assert_eq!(store.count_emails(USER).unwrap(), 5);

    mailbox.expire_history();
    mailbox.deliver(email("late"));
    scheduler.trigger_sync(USER).unwrap().unwrap();
    let done = worker.drain().unwrap();

    assert_eq!(done.len(), 2);
    assert!(matches!(done[0].0.kind, SyncJob::IncrementalSync { .. }));
    assert_eq!(done[0].1, JobOutcome::Escalated);
    assert!(matches!(done[1].0.kind, SyncJob::FullSync { .. }));
    assert_eq!(done[1].0.options.priority, PRIORITY_URGENT);
    assert_eq!(done[1].1, JobOutcome::Completed);
    assert_eq!(store.count_emails(USER).unwrap(), 6);

    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.cursor, Some(mailbox.current_cursor()));
}

#[test]
fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("mailsync.db");
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(150);

    {
        let store = Arc::new(SqliteMailStore::new(&db_path).unwrap());
        configure(store.as_ref());
        let engine = build_engine(&mailbox, &store, &clock);
        let report = engine.full_sync(USER, false, &mut |_| {}).unwrap();
        assert_eq!(report.added, 150);
    }

    let store = Arc::new(SqliteMailStore::new(&db_path).unwrap());
    assert_eq!(store.count_emails(USER).unwrap(), 150);
    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.cursor, Some(mailbox.current_cursor()));
    assert!(state.config.sync_configured);

    mailbox.deliver(email("fresh"));
    let engine = build_engine(&mailbox, &store, &clock);
    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();
    assert_eq!(report.added, 1);
    assert!(
        store
            .find_by_remote_id(USER, &MessageId::new("fresh"))
            .unwrap()
            .is_some()
    );
}

/// Store whose writes fail for chosen items
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryMailStore,
    broken: Mutex<HashSet<MessageId>>,
}

impl FlakyStore {
    fn break_writes(&self, id: &str) {
        self.broken.lock().unwrap().insert(MessageId::new(id));
    }

    fn check(&self, email: &Email) -> Result<()> {
        if self.broken.lock().unwrap().contains(&email.id) {
            return Err(anyhow!("disk I/O error on one row"));
        }
        Ok(())
    }
}

impl MailStore for FlakyStore {
    fn create_email(&self, user_id: &str, email: &Email) -> Result<LocalId> {
        self.check(email)?;
        self.inner.create_email(user_id, email)
    }

    fn upsert_email(&self, user_id: &str, email: &Email) -> Result<LocalId> {
        self.check(email)?;
        self.inner.upsert_email(user_id, email)
    }

    fn delete_emails(&self, user_id: &str, ids: &[MessageId]) -> Result<usize> {
        self.inner.delete_emails(user_id, ids)
    }

    fn find_by_remote_id(&self, user_id: &str, id: &MessageId) -> Result<Option<Email>> {
        self.inner.find_by_remote_id(user_id, id)
    }

    fn find_local_ids(&self, user_id: &str, ids: &[MessageId]) -> Result<Vec<LocalId>> {
        self.inner.find_local_ids(user_id, ids)
    }

    fn count_emails(&self, user_id: &str) -> Result<u64> {
        self.inner.count_emails(user_id)
    }

    fn replace_labels(&self, user_id: &str, labels: &[Label]) -> Result<()> {
        self.inner.replace_labels(user_id, labels)
    }

    fn list_labels(&self, user_id: &str) -> Result<Vec<Label>> {
        self.inner.list_labels(user_id)
    }
}

impl SyncStateStore for FlakyStore {
    fn get_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        self.inner.get_sync_state(user_id)
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.inner.save_sync_state(state)
    }

    fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        self.inner.list_sync_states()
    }
}

#[test]
fn test_store_failure_skips_item_in_full_sync() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(5);
    let store = Arc::new(FlakyStore::default());
    store.break_writes("m0002");
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);

    let report = engine.full_sync(USER, false, &mut |_| {}).unwrap();

    assert_eq!(report.added, 4);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].message_id.as_str(), "m0002");
    assert_eq!(report.errors[0].kind, ErrorKind::Unknown);
    assert_eq!(store.count_emails(USER).unwrap(), 4);

    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Idle);
    assert!(state.checkpoint.is_none());
}

#[test]
fn test_store_failure_skips_item_in_incremental_sync() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(2);
    let store = Arc::new(FlakyStore::default());
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);
    engine.full_sync(USER, false, &mut |_| {}).unwrap();
    store.break_writes("broken");
    store.break_writes("m0001");

    mailbox.deliver(email("fine"));
    mailbox.deliver(email("broken"));
    mailbox.add_labels("m0000", &["STARRED"]);
    mailbox.add_labels("m0001", &["STARRED"]);

    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.updated, 1);
    let failed: Vec<&str> = report.errors.iter().map(|e| e.message_id.as_str()).collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.contains(&"broken") && failed.contains(&"m0001"));

    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.cursor, Some(mailbox.current_cursor()));
}

/// Remote that logs every pending change as one history record
struct SingleRecordHistory(Arc<InMemoryMailbox>);

impl RemoteMailbox for SingleRecordHistory {
    fn list_item_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ItemIdPage, RemoteError> {
        self.0.list_item_ids(query, page_token, page_size)
    }

    fn get_item(&self, id: &MessageId) -> Result<Email, RemoteError> {
        self.0.get_item(id)
    }

    fn list_labels(&self) -> Result<Vec<Label>, RemoteError> {
        self.0.list_labels()
    }

    fn get_current_cursor(&self) -> Result<String, RemoteError> {
        self.0.get_current_cursor()
    }

    fn list_delta_log(
        &self,
        from_cursor: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<DeltaPage, RemoteError> {
        let mut page = self.0.list_delta_log(from_cursor, page_token, max_results)?;
        let position = self.0.current_cursor();
        page.entries = page
            .entries
            .into_iter()
            .map(|entry| entry.at(position.clone()))
            .collect();
        Ok(page)
    }
}

#[test]
fn test_oversized_history_record_is_not_split() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(1);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let mut settings = settings();
    settings.incremental.max_entries = 2;
    let engine = engine_builder(
        Arc::new(SingleRecordHistory(mailbox.clone())),
        &store,
        &clock,
        settings,
    )
    .build();
    engine.full_sync(USER, false, &mut |_| {}).unwrap();

    for i in 0..5 {
        mailbox.deliver(email(&format!("n{i}")));
    }
    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();

    assert_eq!(report.added, 5);
    assert!(!report.has_more);
    assert_eq!(report.cursor, Some(mailbox.current_cursor()));
    assert_eq!(store.count_emails(USER).unwrap(), 6);
}

#[test]
fn test_truncated_pass_queues_continuation() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(3);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let mut settings = settings();
    settings.incremental.max_entries = 2;
    let engine = Arc::new(engine_builder(mailbox.clone(), &store, &clock, settings.clone()).build());
    let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
    let scheduler = Scheduler::new(queue, store.clone(), &settings, engine.log());
    let worker = Worker::new(engine, scheduler.clone());

    scheduler.trigger_sync(USER).unwrap().unwrap();
    worker.drain().unwrap();

    for i in 0..5 {
        mailbox.deliver(email(&format!("n{i}")));
    }
    scheduler.trigger_sync(USER).unwrap().unwrap();
    let done = worker.drain().unwrap();

    assert!(done.len() > 1);
    assert!(
        done.iter()
            .all(|(job, outcome)| matches!(job.kind, SyncJob::IncrementalSync { .. })
                && *outcome == JobOutcome::Completed)
    );
    assert_eq!(store.count_emails(USER).unwrap(), 8);
    let state = store.get_sync_state(USER).unwrap().unwrap();
    assert_eq!(state.cursor, Some(mailbox.current_cursor()));
}

#[test]
fn test_full_sync_stops_at_page_ceiling() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(250);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let mut settings = settings();
    settings.full_sync.max_pages = 2;
    let engine = engine_builder(mailbox.clone(), &store, &clock, settings).build();

    let report = engine.full_sync(USER, false, &mut |_| {}).unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.added, 200);
    assert_eq!(report.stop_reason, StopReason::MaxPages);
}

#[test]
fn test_item_fetch_errors_are_collected() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(5);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let engine = build_engine(&mailbox, &store, &clock);

    mailbox.fail_item("m0003", RemoteError::status(400, "Invalid id"));
    let report = engine.full_sync(USER, false, &mut |_| {}).unwrap();
    assert_eq!(report.added, 4);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].message_id.as_str(), "m0003");
    assert_eq!(report.errors[0].kind, ErrorKind::InvalidRequest);

    mailbox.deliver(email("new0"));
    mailbox.deliver(email("new1"));
    mailbox.fail_item("new1", RemoteError::status(400, "Invalid id"));
    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].message_id.as_str(), "new1");
    assert_eq!(store.count_emails(USER).unwrap(), 5);
}

#[test]
fn test_label_changes_update_without_refiltering() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(3);
    let store = Arc::new(InMemoryMailStore::new());
    configure_with(store.as_ref(), SyncConfig::labels(&["INBOX"]));
    let engine = build_engine(&mailbox, &store, &clock);
    engine.full_sync(USER, false, &mut |_| {}).unwrap();

    mailbox.remove_labels("m0001", &["INBOX"]);
    mailbox.add_labels("m0002", &["STARRED"]);
    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();

    assert_eq!(report.updated, 2);
    assert_eq!(report.added, 0);
    assert_eq!(report.filtered, 0);
    assert_eq!(store.count_emails(USER).unwrap(), 3);
    let archived = store
        .find_by_remote_id(USER, &MessageId::new("m0001"))
        .unwrap()
        .unwrap();
    assert!(!archived.has_label("INBOX"));
    let starred = store
        .find_by_remote_id(USER, &MessageId::new("m0002"))
        .unwrap()
        .unwrap();
    assert!(starred.has_label("STARRED"));
}

#[test]
fn test_new_items_outside_sync_labels_are_filtered() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(2);
    let store = Arc::new(InMemoryMailStore::new());
    configure_with(store.as_ref(), SyncConfig::labels(&["INBOX"]));
    let engine = build_engine(&mailbox, &store, &clock);
    engine.full_sync(USER, false, &mut |_| {}).unwrap();

    mailbox.deliver(labelled("promo", &["CATEGORY_PROMOTIONS"]));
    mailbox.deliver(email("kept"));
    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();

    assert_eq!(report.added, 1);
    assert_eq!(report.filtered, 1);
    assert!(
        store
            .find_by_remote_id(USER, &MessageId::new("promo"))
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_embeddings_follow_created_and_deleted_items() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mailbox = seeded_mailbox(3);
    let store = Arc::new(InMemoryMailStore::new());
    configure(store.as_ref());
    let embeddings = Arc::new(InMemoryEmbeddingQueue::new());
    let engine = engine_builder(mailbox.clone(), &store, &clock, settings())
        .embeddings(embeddings.clone())
        .build();

    engine.full_sync(USER, false, &mut |_| {}).unwrap();
    let mut created = store
        .find_local_ids(
            USER,
            &[
                MessageId::new("m0000"),
                MessageId::new("m0001"),
                MessageId::new("m0002"),
            ],
        )
        .unwrap();
    let mut pending = embeddings.pending(USER);
    created.sort();
    pending.sort();
    assert_eq!(pending, created);

    let deleted = store
        .find_local_ids(USER, &[MessageId::new("m0000")])
        .unwrap();
    mailbox.delete("m0000");
    mailbox.deliver(email("fresh"));
    let report = engine.incremental_sync(USER, &mut |_| {}).unwrap();
    assert_eq!(report.deleted, 1);

    let pending = embeddings.pending(USER);
    assert_eq!(pending.len(), 3);
    assert!(!pending.contains(&deleted[0]));
    let fresh = store
        .find_local_ids(USER, &[MessageId::new("fresh")])
        .unwrap();
    assert!(pending.contains(&fresh[0]));
}
