//! mailsyncd - background mailbox sync daemon
//!
//! Opens the local store, starts the job worker, registers the periodic
//! cursor check and queues a sync for every configured user.

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use mailsync::{
    Clock, GmailCredentials, GmailMailboxProvider, InMemoryJobQueue, JobQueue, OAuthTokenSource,
    Scheduler, SqliteMailStore, SyncEngine, SyncLog, SyncSettings, SystemClock, Worker,
};

/// Timeout for a single Gmail API request
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run() {
        error!("mailsyncd failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let settings = SyncSettings::load().context("Failed to load settings")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let db_path = settings.resolved_db_path()?;
    info!("Opening mail store at {}", db_path.display());
    let store = Arc::new(SqliteMailStore::new(&db_path)?);

    let credentials = match GmailCredentials::load() {
        Ok(creds) => creds,
        Err(e) => {
            if let Some(path) = GmailCredentials::default_credentials_path() {
                warn!(
                    "To configure Gmail access, either:\n\
                     1. Place your Google OAuth credentials at: {}\n\
                     2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                    path.display()
                );
            }
            return Err(e.context("Gmail credentials not found"));
        }
    };
    let tokens = Arc::new(OAuthTokenSource::load(credentials, clock.clone())?);

    let mut users = settings.users.clone();
    if users.is_empty() {
        users = tokens.users().map(str::to_string).collect();
        users.sort();
    }
    if users.is_empty() {
        warn!("No users configured; add them to mailsync.json or gmail-tokens.json");
    }

    let provider = Arc::new(GmailMailboxProvider::new(
        tokens,
        clock.clone(),
        HTTP_TIMEOUT,
    )?);
    let log = SyncLog::global("mailsync");
    let engine = Arc::new(
        SyncEngine::builder(provider, store.clone(), store.clone())
            .settings(settings.clone())
            .clock(clock.clone())
            .log(log.clone())
            .build(),
    );

    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new(clock));
    let scheduler = Scheduler::new(queue, store, &settings, &log);

    scheduler.recover_interrupted()?;
    scheduler.register_cursor_check()?;
    scheduler.restore_recurring()?;
    for user in &users {
        if let Err(e) = scheduler.trigger_sync(user) {
            error!("Failed to queue initial sync for {}: {:#}", user, e);
        }
        if let Err(e) = scheduler.start_recurring_sync(user) {
            error!("Failed to start recurring sync for {}: {:#}", user, e);
        }
    }

    let worker = Arc::new(Worker::new(engine, scheduler));
    let handle = worker.start()?;
    info!(
        "mailsyncd running for {} users with {} workers",
        users.len(),
        settings.worker.concurrency
    );
    handle.join();
    Ok(())
}
