//! SQLite-based mail storage

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, ffi, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{LocalId, MailStore, SyncStateStore, UniqueConstraintError};
use crate::models::{
    Email, EmailAddress, FullSyncCheckpoint, Label, LabelId, MessageId, SyncConfig, SyncState,
    SyncStatus, ThreadId,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Synced items, unique per user and remote id
            CREATE TABLE emails (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                from_name TEXT,
                from_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                body_text TEXT,
                received_at TEXT NOT NULL,
                UNIQUE (user_id, remote_id)
            );

            CREATE INDEX idx_emails_user_thread ON emails(user_id, thread_id);

            -- Recipients (normalized)
            CREATE TABLE email_recipients (
                email_id INTEGER NOT NULL,
                recipient_type TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT,
                email TEXT NOT NULL,
                PRIMARY KEY (email_id, recipient_type, position),
                FOREIGN KEY (email_id) REFERENCES emails(local_id) ON DELETE CASCADE
            );

            -- Labels on items (many-to-many)
            CREATE TABLE email_labels (
                email_id INTEGER NOT NULL,
                label_id TEXT NOT NULL,
                PRIMARY KEY (email_id, label_id),
                FOREIGN KEY (email_id) REFERENCES emails(local_id) ON DELETE CASCADE
            );

            CREATE INDEX idx_email_labels_label ON email_labels(label_id);

            -- Remote label catalogue per user
            CREATE TABLE labels (
                user_id TEXT NOT NULL,
                label_id TEXT NOT NULL,
                name TEXT NOT NULL,
                is_system INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, label_id)
            );

            -- Sync state per user
            CREATE TABLE sync_state (
                user_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'idle',
                cursor TEXT,
                cursor_set_at TEXT,
                last_sync_at TEXT,
                last_full_sync_at TEXT,
                sync_error TEXT,
                checkpoint TEXT,
                sync_configured INTEGER NOT NULL DEFAULT 0,
                sync_labels TEXT NOT NULL DEFAULT '[]',
                exclude_labels TEXT NOT NULL DEFAULT '[]',
                max_email_age_days INTEGER,
                recurring_enabled INTEGER NOT NULL DEFAULT 0,
                email_count INTEGER NOT NULL DEFAULT 0,
                label_count INTEGER NOT NULL DEFAULT 0,
                contact_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        ),
        // Migration 2: Newest-first listing per user
        M::up("CREATE INDEX idx_emails_user_received ON emails(user_id, received_at DESC);"),
    ])
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// (local_id, thread_id, from_name, from_email, subject, snippet, body_text, received_at)
type EmailRow = (
    LocalId,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    String,
);

/// Duplicate key only; NOT NULL and CHECK failures are real errors
fn is_unique_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
    )
}

/// SQLite-based mail and sync-state storage
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    /// Open (creating if needed) the database at `db_path` and migrate it
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed during sync writes; foreign_keys is
        // required for the ON DELETE CASCADE on recipients and labels.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace recipients and labels of a stored item
    fn write_children(tx: &Transaction<'_>, local_id: LocalId, email: &Email) -> Result<()> {
        tx.execute(
            "DELETE FROM email_recipients WHERE email_id = ?",
            [local_id],
        )?;
        tx.execute("DELETE FROM email_labels WHERE email_id = ?", [local_id])?;

        let mut recipients = tx.prepare(
            "INSERT INTO email_recipients (email_id, recipient_type, position, name, email)
             VALUES (?, ?, ?, ?, ?)",
        )?;
        for (recipient_type, addrs) in [("to", &email.to), ("cc", &email.cc)] {
            for (i, addr) in addrs.iter().enumerate() {
                recipients.execute(params![
                    local_id,
                    recipient_type,
                    i as i64,
                    addr.name,
                    addr.email
                ])?;
            }
        }

        let mut labels =
            tx.prepare("INSERT OR IGNORE INTO email_labels (email_id, label_id) VALUES (?, ?)")?;
        for label in &email.label_ids {
            labels.execute(params![local_id, label])?;
        }

        Ok(())
    }

    fn load_recipients(
        conn: &Connection,
        local_id: LocalId,
        recipient_type: &str,
    ) -> Result<Vec<EmailAddress>> {
        let mut stmt = conn.prepare(
            "SELECT name, email FROM email_recipients
             WHERE email_id = ? AND recipient_type = ?
             ORDER BY position",
        )?;

        let recipients = stmt
            .query_map(params![local_id, recipient_type], |row| {
                Ok(EmailAddress {
                    name: row.get(0)?,
                    email: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(recipients)
    }

    fn load_labels(conn: &Connection, local_id: LocalId) -> Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT label_id FROM email_labels WHERE email_id = ? ORDER BY rowid")?;

        let labels = stmt
            .query_map([local_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(labels)
    }
}

impl MailStore for SqliteMailStore {
    fn create_email(&self, user_id: &str, email: &Email) -> Result<LocalId> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = tx.query_row(
            "INSERT INTO emails
             (user_id, remote_id, thread_id, from_name, from_email, subject, snippet,
              body_text, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING local_id",
            params![
                user_id,
                email.id.as_str(),
                email.thread_id.as_str(),
                email.from.name,
                email.from.email,
                email.subject,
                email.snippet,
                email.body_text,
                email.received_at.to_rfc3339(),
            ],
            |row| row.get::<_, LocalId>(0),
        );

        let local_id = match inserted {
            Ok(id) => id,
            Err(e) if is_unique_conflict(&e) => {
                return Err(UniqueConstraintError {
                    user_id: user_id.to_string(),
                    message_id: email.id.clone(),
                }
                .into());
            }
            Err(e) => return Err(e).context("Failed to insert email"),
        };

        Self::write_children(&tx, local_id, email)?;
        tx.commit()?;
        Ok(local_id)
    }

    fn upsert_email(&self, user_id: &str, email: &Email) -> Result<LocalId> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        // ON CONFLICT DO UPDATE keeps the row (and its local id) in place
        let local_id: LocalId = tx.query_row(
            "INSERT INTO emails
             (user_id, remote_id, thread_id, from_name, from_email, subject, snippet,
              body_text, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, remote_id) DO UPDATE SET
                thread_id = excluded.thread_id,
                from_name = excluded.from_name,
                from_email = excluded.from_email,
                subject = excluded.subject,
                snippet = excluded.snippet,
                body_text = excluded.body_text,
                received_at = excluded.received_at
             RETURNING local_id",
            params![
                user_id,
                email.id.as_str(),
                email.thread_id.as_str(),
                email.from.name,
                email.from.email,
                email.subject,
                email.snippet,
                email.body_text,
                email.received_at.to_rfc3339(),
            ],
            |row| row.get(0),
        )?;

        Self::write_children(&tx, local_id, email)?;
        tx.commit()?;
        Ok(local_id)
    }

    fn delete_emails(&self, user_id: &str, ids: &[MessageId]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM emails WHERE user_id = ? AND remote_id = ?")?;
            for id in ids {
                deleted += stmt.execute(params![user_id, id.as_str()])?;
            }
        }

        tx.commit()?;
        Ok(deleted)
    }

    fn find_by_remote_id(&self, user_id: &str, id: &MessageId) -> Result<Option<Email>> {
        let conn = self.conn();

        let row: Option<EmailRow> = conn
            .query_row(
                "SELECT local_id, thread_id, from_name, from_email, subject, snippet,
                        body_text, received_at
                 FROM emails WHERE user_id = ? AND remote_id = ?",
                params![user_id, id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            local_id,
            thread_id,
            from_name,
            from_email,
            subject,
            snippet,
            body_text,
            received_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(Email {
            id: id.clone(),
            thread_id: ThreadId::new(thread_id),
            from: EmailAddress {
                name: from_name,
                email: from_email,
            },
            to: Self::load_recipients(&conn, local_id, "to")?,
            cc: Self::load_recipients(&conn, local_id, "cc")?,
            subject,
            snippet,
            body_text,
            received_at: parse_timestamp(&received_at).unwrap_or_else(Utc::now),
            label_ids: Self::load_labels(&conn, local_id)?,
        }))
    }

    fn find_local_ids(&self, user_id: &str, ids: &[MessageId]) -> Result<Vec<LocalId>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT local_id FROM emails WHERE user_id = ? AND remote_id = ?")?;

        let mut local_ids = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(local_id) = stmt
                .query_row(params![user_id, id.as_str()], |row| row.get(0))
                .optional()?
            {
                local_ids.push(local_id);
            }
        }

        Ok(local_ids)
    }

    fn count_emails(&self, user_id: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM emails WHERE user_id = ?",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn replace_labels(&self, user_id: &str, labels: &[Label]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM labels WHERE user_id = ?", [user_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO labels (user_id, label_id, name, is_system)
                 VALUES (?, ?, ?, ?)",
            )?;
            for label in labels {
                stmt.execute(params![
                    user_id,
                    label.id.as_str(),
                    label.name,
                    label.is_system
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn list_labels(&self, user_id: &str) -> Result<Vec<Label>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT label_id, name, is_system FROM labels WHERE user_id = ? ORDER BY label_id",
        )?;

        let labels = stmt
            .query_map([user_id], |row| {
                Ok(Label {
                    id: LabelId::new(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    is_system: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(labels)
    }
}

/// Columns of `sync_state` in select order
const SYNC_STATE_COLUMNS: &str = "user_id, status, cursor, cursor_set_at, last_sync_at,
     last_full_sync_at, sync_error, checkpoint, sync_configured, sync_labels,
     exclude_labels, max_email_age_days, recurring_enabled, email_count, label_count,
     contact_count";

/// Raw `sync_state` row before JSON and timestamp decoding
struct SyncStateRow {
    user_id: String,
    status: String,
    cursor: Option<String>,
    cursor_set_at: Option<String>,
    last_sync_at: Option<String>,
    last_full_sync_at: Option<String>,
    sync_error: Option<String>,
    checkpoint: Option<String>,
    sync_configured: bool,
    sync_labels: String,
    exclude_labels: String,
    max_email_age_days: Option<u32>,
    recurring_enabled: bool,
    email_count: i64,
    label_count: i64,
    contact_count: i64,
}

impl SyncStateRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            status: row.get(1)?,
            cursor: row.get(2)?,
            cursor_set_at: row.get(3)?,
            last_sync_at: row.get(4)?,
            last_full_sync_at: row.get(5)?,
            sync_error: row.get(6)?,
            checkpoint: row.get(7)?,
            sync_configured: row.get(8)?,
            sync_labels: row.get(9)?,
            exclude_labels: row.get(10)?,
            max_email_age_days: row.get(11)?,
            recurring_enabled: row.get(12)?,
            email_count: row.get(13)?,
            label_count: row.get(14)?,
            contact_count: row.get(15)?,
        })
    }

    fn into_state(self) -> Result<SyncState> {
        let checkpoint: Option<FullSyncCheckpoint> = self
            .checkpoint
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("Corrupt checkpoint for user {}", self.user_id))?;

        Ok(SyncState {
            status: SyncStatus::parse(&self.status),
            cursor: self.cursor,
            cursor_set_at: self.cursor_set_at.as_deref().and_then(parse_timestamp),
            last_sync_at: self.last_sync_at.as_deref().and_then(parse_timestamp),
            last_full_sync_at: self.last_full_sync_at.as_deref().and_then(parse_timestamp),
            sync_error: self.sync_error,
            checkpoint,
            config: SyncConfig {
                sync_configured: self.sync_configured,
                sync_labels: serde_json::from_str(&self.sync_labels).unwrap_or_default(),
                exclude_labels: serde_json::from_str(&self.exclude_labels).unwrap_or_default(),
                max_email_age_days: self.max_email_age_days,
            },
            recurring_enabled: self.recurring_enabled,
            email_count: self.email_count as u64,
            label_count: self.label_count as u64,
            contact_count: self.contact_count as u64,
            user_id: self.user_id,
        })
    }
}

impl SyncStateStore for SqliteMailStore {
    fn get_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {SYNC_STATE_COLUMNS} FROM sync_state WHERE user_id = ?"),
                [user_id],
                SyncStateRow::from_row,
            )
            .optional()?;

        row.map(SyncStateRow::into_state).transpose()
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let checkpoint = state
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let sync_labels = serde_json::to_string(&state.config.sync_labels)?;
        let exclude_labels = serde_json::to_string(&state.config.exclude_labels)?;

        self.conn().execute(
            &format!(
                "INSERT INTO sync_state ({SYNC_STATE_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    status = excluded.status,
                    cursor = excluded.cursor,
                    cursor_set_at = excluded.cursor_set_at,
                    last_sync_at = excluded.last_sync_at,
                    last_full_sync_at = excluded.last_full_sync_at,
                    sync_error = excluded.sync_error,
                    checkpoint = excluded.checkpoint,
                    sync_configured = excluded.sync_configured,
                    sync_labels = excluded.sync_labels,
                    exclude_labels = excluded.exclude_labels,
                    max_email_age_days = excluded.max_email_age_days,
                    recurring_enabled = excluded.recurring_enabled,
                    email_count = excluded.email_count,
                    label_count = excluded.label_count,
                    contact_count = excluded.contact_count"
            ),
            params![
                state.user_id,
                state.status.as_str(),
                state.cursor,
                state.cursor_set_at.map(|t| t.to_rfc3339()),
                state.last_sync_at.map(|t| t.to_rfc3339()),
                state.last_full_sync_at.map(|t| t.to_rfc3339()),
                state.sync_error,
                checkpoint,
                state.config.sync_configured,
                sync_labels,
                exclude_labels,
                state.config.max_email_age_days,
                state.recurring_enabled,
                state.email_count as i64,
                state.label_count as i64,
                state.contact_count as i64,
            ],
        )?;

        Ok(())
    }

    fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYNC_STATE_COLUMNS} FROM sync_state ORDER BY user_id"
        ))?;

        let rows = stmt
            .query_map([], SyncStateRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(SyncStateRow::into_state).collect()
    }
}
