//! Incremental (delta-log) sync
//!
//! Replays the remote delta log from the stored cursor: deletions are
//! applied locally, new and changed items are fetched and stored, and the
//! cursor advances to the last change consumed.

use serde::Serialize;

use super::{
    DeltaSet, ItemError, Stored, SyncFilter, SyncProgress, SyncResources, categorize, skip_item,
    store_item,
};
use crate::config::IncrementalSyncSettings;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::models::{DeltaEntry, MessageId, SyncState};
use crate::storage::LocalId;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncrementalSyncReport {
    /// Sync is not configured for the user; nothing was done
    pub skipped: bool,
    pub entries: usize,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    /// New items rejected by the sync filter
    pub filtered: u64,
    pub errors: Vec<ItemError>,
    /// The delta log holds more changes than this pass consumed
    pub has_more: bool,
    pub cursor: Option<String>,
}

/// Delta entries read in one pass
struct DeltaFetch {
    entries: Vec<DeltaEntry>,
    has_more: bool,
    cursor: String,
}

pub struct IncrementalSyncOrchestrator<'a> {
    res: SyncResources<'a>,
    settings: &'a IncrementalSyncSettings,
}

impl<'a> IncrementalSyncOrchestrator<'a> {
    pub fn new(res: SyncResources<'a>, settings: &'a IncrementalSyncSettings) -> Self {
        Self { res, settings }
    }

    pub fn run(
        &self,
        on_progress: &mut dyn FnMut(&SyncProgress),
    ) -> SyncResult<IncrementalSyncReport> {
        let ctx = self.res.ctx;
        let mut state = self.res.states.load_or_default(&ctx.user_id)?;

        if !state.config.sync_configured {
            ctx.log
                .debug(format_args!("Sync not configured, skipping incremental sync"));
            return Ok(IncrementalSyncReport {
                skipped: true,
                ..IncrementalSyncReport::default()
            });
        }
        let Some(cursor) = state.cursor.clone() else {
            return Err(SyncError::missing_cursor());
        };

        state.begin();
        self.res.states.save_sync_state(&state)?;

        match self.execute(&mut state, &cursor, on_progress) {
            Ok(report) => {
                ctx.log.info(format_args!(
                    "Incremental sync complete: {} entries, {} added, {} updated, {} deleted{}",
                    report.entries,
                    report.added,
                    report.updated,
                    report.deleted,
                    if report.has_more { " (more pending)" } else { "" }
                ));
                Ok(report)
            }
            Err(err) => {
                ctx.log.error(format_args!("Incremental sync failed: {}", err));
                state.fail(err.to_string());
                if let Err(e) = self.res.states.save_sync_state(&state) {
                    ctx.log
                        .error(format_args!("Failed to record sync failure: {:#}", e));
                }
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        state: &mut SyncState,
        cursor: &str,
        on_progress: &mut dyn FnMut(&SyncProgress),
    ) -> SyncResult<IncrementalSyncReport> {
        let ctx = self.res.ctx;
        let fetch = self.fetch_delta(cursor)?;
        let delta = categorize(&fetch.entries);

        let mut report = IncrementalSyncReport {
            entries: fetch.entries.len(),
            has_more: fetch.has_more,
            ..IncrementalSyncReport::default()
        };
        let mut progress = SyncProgress::default();

        if !delta.is_empty() {
            self.apply(state, &delta, &mut report, &mut progress, on_progress)?;
        }

        let now = ctx.clock.now();
        state.set_cursor(fetch.cursor.clone(), now);
        state.email_count = self.res.store.count_emails(&ctx.user_id)?;
        state.succeed(now);
        self.res.states.save_sync_state(state)?;

        report.cursor = Some(fetch.cursor);
        Ok(report)
    }

    /// Read the delta log from `cursor`, up to the entry and page limits
    ///
    /// A pass only ever stops on a record boundary: the next pass resumes
    /// after the last consumed position, so a record cut in half would lose
    /// its remaining entries. A single record larger than the entry cap is
    /// consumed whole.
    fn fetch_delta(&self, cursor: &str) -> SyncResult<DeltaFetch> {
        let max_entries = self.settings.max_entries.max(1);
        let page_size = self.settings.page_size.max(1);
        let mut entries: Vec<DeltaEntry> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut latest_cursor: Option<String> = None;
        let mut pages = 0;

        let has_more = loop {
            let remaining = max_entries.saturating_sub(entries.len());
            let request = if remaining == 0 {
                page_size
            } else {
                page_size.min(u32::try_from(remaining).unwrap_or(u32::MAX))
            };
            let page = self
                .res
                .api
                .list_delta_log(cursor, page_token.as_deref(), request)
                .map_err(|err| match err.kind() {
                    ErrorKind::NotFound | ErrorKind::InvalidRequest => {
                        SyncError::cursor_expired(err.message())
                    }
                    _ => err,
                })?;
            pages += 1;
            entries.extend(page.entries);
            latest_cursor = page.new_cursor.or(latest_cursor);

            let Some(token) = page.next_page_token else {
                // End of the log: the trailing record is complete
                match record_cut(&entries, max_entries, true) {
                    Some(cut) if cut < entries.len() => {
                        entries.truncate(cut);
                        break true;
                    }
                    _ => break false,
                }
            };

            if entries.len() >= max_entries || pages >= self.settings.max_pages {
                if entries.is_empty() {
                    break true;
                }
                if let Some(cut) = record_cut(&entries, max_entries, false) {
                    entries.truncate(cut);
                    break true;
                }
                // Still inside the first record; read on until it closes
            }
            page_token = Some(token);
        };

        let cursor = if has_more {
            entries
                .last()
                .and_then(|e| e.position.clone())
                .unwrap_or_else(|| cursor.to_string())
        } else {
            latest_cursor.unwrap_or_else(|| cursor.to_string())
        };

        Ok(DeltaFetch {
            entries,
            has_more,
            cursor,
        })
    }

    fn apply(
        &self,
        state: &SyncState,
        delta: &DeltaSet,
        report: &mut IncrementalSyncReport,
        progress: &mut SyncProgress,
        on_progress: &mut dyn FnMut(&SyncProgress),
    ) -> SyncResult<()> {
        let ctx = self.res.ctx;
        let user_id = &ctx.user_id;

        if !delta.to_delete.is_empty() {
            let ids: Vec<MessageId> = delta.to_delete.iter().cloned().collect();
            let local_ids = self.res.store.find_local_ids(user_id, &ids)?;
            report.deleted = self.res.store.delete_emails(user_id, &ids)? as u64;
            self.res.embeddings.remove(ctx, &local_ids);
            progress.deleted = report.deleted;
            progress.processed += ids.len() as u64;
            on_progress(progress);
        }

        let mut created: Vec<LocalId> = Vec::new();

        if !delta.to_add.is_empty() {
            let filter = SyncFilter::from_config(&state.config, ctx.clock.now());
            let ids: Vec<MessageId> = delta.to_add.iter().cloned().collect();

            for (id, fetched) in self.res.api.get_items(&ids, self.settings.fetch_concurrency) {
                let Some(email) = self.accept(id, fetched, report)? else {
                    continue;
                };
                if !filter.should_include(&email) {
                    report.filtered += 1;
                    continue;
                }
                // A concurrent pass may have stored it first; that is an update
                match store_item(self.res.store, user_id, &email) {
                    Ok(Stored::Created(local_id)) => {
                        report.added += 1;
                        created.push(local_id);
                    }
                    Ok(Stored::Updated(_)) => report.updated += 1,
                    Err(err) => skip_item(ctx, &mut report.errors, email.id, err)?,
                }
            }
            progress.processed += ids.len() as u64;
            progress.added = report.added;
            progress.updated = report.updated;
            on_progress(progress);
        }

        if !delta.to_update.is_empty() {
            let ids: Vec<MessageId> = delta.to_update.iter().cloned().collect();

            for (id, fetched) in self.res.api.get_items(&ids, self.settings.fetch_concurrency) {
                let Some(email) = self.accept(id, fetched, report)? else {
                    continue;
                };
                match self.res.store.upsert_email(user_id, &email) {
                    Ok(_) => report.updated += 1,
                    Err(e) => skip_item(ctx, &mut report.errors, email.id, e.into())?,
                }
            }
            progress.processed += ids.len() as u64;
            progress.updated = report.updated;
            on_progress(progress);
        }

        self.res.embeddings.submit(ctx, &created);
        Ok(())
    }

    /// Triage one fetch result
    ///
    /// Items gone from the remote since their change was logged are skipped;
    /// account-wide failures abort the pass; anything else is recorded.
    fn accept<T>(
        &self,
        id: MessageId,
        fetched: SyncResult<T>,
        report: &mut IncrementalSyncReport,
    ) -> SyncResult<Option<T>> {
        match fetched {
            Ok(item) => Ok(Some(item)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.res
                    .ctx
                    .log
                    .debug(format_args!("{} no longer exists remotely", id));
                Ok(None)
            }
            Err(err) => {
                skip_item(self.res.ctx, &mut report.errors, id, err)?;
                Ok(None)
            }
        }
    }
}

/// Where to cut `entries` so that only whole records are consumed
///
/// Record boundaries are the points where the position changes; the end of
/// `entries` is one only when `tail_complete`. Picks the last boundary within
/// `max_entries`, or failing that the first one past it. `None` means no
/// boundary has been seen yet.
fn record_cut(entries: &[DeltaEntry], max_entries: usize, tail_complete: bool) -> Option<usize> {
    let mut boundaries: Vec<usize> = (1..entries.len())
        .filter(|&i| entries[i - 1].position != entries[i].position)
        .collect();
    if tail_complete && !entries.is_empty() {
        boundaries.push(entries.len());
    }
    boundaries
        .iter()
        .rev()
        .find(|&&cut| cut <= max_entries)
        .or_else(|| boundaries.iter().find(|&&cut| cut > max_entries))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(entries: &[(&str, &str)]) -> Vec<DeltaEntry> {
        entries
            .iter()
            .map(|(id, position)| DeltaEntry::added(*id).at(*position))
            .collect()
    }

    #[test]
    fn test_cut_stops_before_partial_record() {
        let entries = at(&[("a", "10"), ("b", "11"), ("c", "11")]);
        assert_eq!(record_cut(&entries, 2, false), Some(1));
        assert_eq!(record_cut(&entries, 3, false), Some(1));
        assert_eq!(record_cut(&entries, 3, true), Some(3));
    }

    #[test]
    fn test_oversized_first_record_is_taken_whole() {
        let entries = at(&[("a", "10"), ("b", "10"), ("c", "10"), ("d", "11")]);
        assert_eq!(record_cut(&entries, 2, false), Some(3));

        let open = at(&[("a", "10"), ("b", "10")]);
        assert_eq!(record_cut(&open, 1, false), None);
        assert_eq!(record_cut(&open, 1, true), Some(2));
    }
}
