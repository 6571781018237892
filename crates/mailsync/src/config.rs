//! Configuration loading for the sync engine
//!
//! Settings are read from (in order of priority):
//! 1. Environment variable overrides
//! 2. `mailsync.json` in the mailsync config directory
//! 3. Built-in defaults
//!
//! OAuth client credentials are read from `google-credentials.json` or the
//! `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings filename in the mailsync config directory
const SETTINGS_FILE: &str = "mailsync.json";

/// Credentials filename in the mailsync config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Quota windows enforced per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Quota units per user per second
    pub units_per_second: u32,
    /// Quota units per user per minute
    pub units_per_minute: u32,
    /// Longest a single call waits for quota before failing
    pub wait_timeout_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            units_per_second: 250,
            units_per_minute: 15_000,
            wait_timeout_ms: 30_000,
        }
    }
}

impl RateLimitSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Retry policy applied by the remote facade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullSyncSettings {
    /// Ids listed per page
    pub page_size: u32,
    /// Stop after this many items (None = whole mailbox)
    pub max_items: Option<u64>,
    /// Hard ceiling on pages per pass
    pub max_pages: u32,
    /// Item bodies fetched in parallel
    pub fetch_concurrency: usize,
}

impl Default for FullSyncSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_items: None,
            max_pages: 1_000,
            fetch_concurrency: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalSyncSettings {
    /// Delta entries consumed per pass
    pub max_entries: usize,
    /// Delta entries requested per page
    pub page_size: u32,
    /// Hard ceiling on delta-log pages per pass
    pub max_pages: u32,
    pub fetch_concurrency: usize,
}

impl Default for IncrementalSyncSettings {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            page_size: 500,
            max_pages: 50,
            fetch_concurrency: 10,
        }
    }
}

/// Cursor expiration monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorSettings {
    /// Remote cursor lifetime
    pub ttl_days: i64,
    /// Lead time before expiry at which a cursor counts as expiring soon
    pub warning_days: i64,
    /// Expiring cursors this close to expiry get a proactive full sync
    pub proactive_days: i64,
    /// Schedule full syncs for expired cursors automatically
    pub auto_full_sync: bool,
    pub check_interval_secs: u64,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            warning_days: 7,
            proactive_days: 2,
            auto_full_sync: true,
            check_interval_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Jobs processed in parallel
    pub concurrency: usize,
    /// Interval of the per-user recurring incremental sync
    pub recurring_interval_secs: u64,
    /// How long an idle worker slot blocks waiting for a job
    pub poll_interval_ms: u64,
    /// Delay before retrying a job whose user already has a pass running
    pub busy_user_delay_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            recurring_interval_secs: 5 * 60,
            poll_interval_ms: 1_000,
            busy_user_delay_ms: 30_000,
        }
    }
}

/// Downstream embedding queue batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay_ms: 100,
        }
    }
}

/// All tunables of the sync engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub full_sync: FullSyncSettings,
    pub incremental: IncrementalSyncSettings,
    pub cursor: CursorSettings,
    pub worker: WorkerSettings,
    pub embeddings: EmbeddingSettings,
    /// SQLite database path (defaults to the mailsync data directory)
    pub db_path: Option<PathBuf>,
    /// Users synced by the daemon
    pub users: Vec<String>,
}

impl SyncSettings {
    /// Load settings from the config directory, then apply env overrides
    pub fn load() -> Result<Self> {
        let mut settings = if config::config_exists(SETTINGS_FILE) {
            config::load_json(SETTINGS_FILE)?
        } else {
            Self::default()
        };
        settings.apply_env()?;
        Ok(settings)
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse settings JSON")
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("MAILSYNC_WORKER_CONCURRENCY") {
            self.worker.concurrency = value
                .parse()
                .context("MAILSYNC_WORKER_CONCURRENCY must be a positive integer")?;
        }
        if let Ok(path) = std::env::var("MAILSYNC_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Resolve the database path, falling back to the data directory
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => config::data_path("mailsync.db").context("Could not determine data directory"),
        }
    }
}

/// OAuth client credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format (installed app)
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials from the config directory, falling back to env vars
    pub fn load() -> Result<Self> {
        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }
        Self::from_env()
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}
