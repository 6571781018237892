//! Full (paginated, resumable) import
//!
//! Lists every item matching the user's filter, page by page, fetching and
//! storing each page before persisting a checkpoint. A failed pass keeps its
//! checkpoint so the next attempt resumes from the last completed page.

use serde::Serialize;

use super::{ItemError, Stored, SyncFilter, SyncProgress, SyncResources, skip_item, store_item};
use crate::config::FullSyncSettings;
use crate::error::SyncResult;
use crate::models::{FullSyncCheckpoint, MessageId, SyncState};
use crate::storage::LocalId;

/// Why the page loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The remote listing has no more pages
    Exhausted,
    /// The configured item cap was reached
    MaxItems,
    /// The hard page ceiling was reached
    MaxPages,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullSyncReport {
    pub resumed: bool,
    pub pages: u32,
    /// Items processed, including those processed before a resume
    pub processed: u64,
    pub added: u64,
    pub updated: u64,
    pub errors: Vec<ItemError>,
    pub stop_reason: StopReason,
    pub cursor: Option<String>,
}

pub struct FullSyncOrchestrator<'a> {
    res: SyncResources<'a>,
    settings: &'a FullSyncSettings,
}

impl<'a> FullSyncOrchestrator<'a> {
    pub fn new(res: SyncResources<'a>, settings: &'a FullSyncSettings) -> Self {
        Self { res, settings }
    }

    /// Run a full sync, resuming from the stored checkpoint when `resume` is set
    pub fn run(
        &self,
        resume: bool,
        on_progress: &mut dyn FnMut(&SyncProgress),
    ) -> SyncResult<FullSyncReport> {
        let ctx = self.res.ctx;
        let mut state = self.res.states.load_or_default(&ctx.user_id)?;
        state.begin();
        self.res.states.save_sync_state(&state)?;

        match self.execute(&mut state, resume, on_progress) {
            Ok(report) => {
                ctx.log.info(format_args!(
                    "Full sync complete: {} pages, {} added, {} updated, {} errors ({:?})",
                    report.pages,
                    report.added,
                    report.updated,
                    report.errors.len(),
                    report.stop_reason
                ));
                Ok(report)
            }
            Err(err) => {
                ctx.log.error(format_args!("Full sync failed: {}", err));
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
        resume: bool,
        on_progress: &mut dyn FnMut(&SyncProgress),
    ) -> SyncResult<FullSyncReport> {
        let ctx = self.res.ctx;
        let stored = if resume { state.checkpoint.clone() } else { None };
        let resumed = stored.is_some();

        let mut checkpoint = match stored {
            Some(checkpoint) => {
                ctx.log.info(format_args!(
                    "Resuming full sync after {} items",
                    checkpoint.progress
                ));
                checkpoint
            }
            None => {
                if resume {
                    ctx.log
                        .info(format_args!("No checkpoint stored, starting fresh"));
                }
                self.sync_labels(state)?;
                // Changes made during the import are replayed from here
                let cursor = self.res.api.get_current_cursor()?;
                let checkpoint = FullSyncCheckpoint::new(ctx.clock.now(), Some(cursor));
                state.checkpoint = Some(checkpoint.clone());
                self.res.states.save_sync_state(state)?;
                checkpoint
            }
        };

        let filter = SyncFilter::from_config(&state.config, ctx.clock.now());
        let query = filter.to_query();

        let mut progress = SyncProgress {
            processed: checkpoint.progress,
            ..SyncProgress::default()
        };
        let mut errors = Vec::new();

        let stop_reason = loop {
            if progress.pages >= self.settings.max_pages {
                break StopReason::MaxPages;
            }
            let remaining = match self.settings.max_items {
                Some(max) if checkpoint.progress >= max => break StopReason::MaxItems,
                Some(max) => max - checkpoint.progress,
                None => u64::MAX,
            };
            let page_size = u64::from(self.settings.page_size.max(1)).min(remaining) as u32;

            let page = self.res.api.list_item_ids(
                query.as_deref(),
                checkpoint.page_token.as_deref(),
                page_size,
            )?;
            progress.pages += 1;

            let created = self.store_page(&page.ids, &mut progress, &mut errors)?;
            self.res.embeddings.submit(ctx, &created);

            checkpoint.progress += page.ids.len() as u64;
            checkpoint.page_token = page.next_page_token;
            state.checkpoint = Some(checkpoint.clone());
            self.res.states.save_sync_state(state)?;

            progress.processed = checkpoint.progress;
            on_progress(&progress);
            ctx.log.debug(format_args!(
                "Page {} stored ({} items so far)",
                progress.pages, checkpoint.progress
            ));

            if checkpoint.page_token.is_none() {
                break StopReason::Exhausted;
            }
        };

        let now = ctx.clock.now();
        let cursor = match checkpoint.cursor {
            Some(cursor) => cursor,
            None => self.res.api.get_current_cursor()?,
        };
        state.checkpoint = None;
        state.set_cursor(cursor.clone(), now);
        state.last_full_sync_at = Some(now);
        state.email_count = self.res.store.count_emails(&ctx.user_id)?;
        state.succeed(now);
        self.res.states.save_sync_state(state)?;

        Ok(FullSyncReport {
            resumed,
            pages: progress.pages,
            processed: progress.processed,
            added: progress.added,
            updated: progress.updated,
            errors,
            stop_reason,
            cursor: Some(cursor),
        })
    }

    fn sync_labels(&self, state: &mut SyncState) -> SyncResult<()> {
        let labels = self.res.api.list_labels()?;
        self.res
            .store
            .replace_labels(&self.res.ctx.user_id, &labels)?;
        state.label_count = labels.len() as u64;
        Ok(())
    }

    /// Fetch and store one page, returning local ids of created items
    fn store_page(
        &self,
        ids: &[MessageId],
        progress: &mut SyncProgress,
        errors: &mut Vec<ItemError>,
    ) -> SyncResult<Vec<LocalId>> {
        let user_id = &self.res.ctx.user_id;
        let mut created = Vec::new();

        for (id, fetched) in self.res.api.get_items(ids, self.settings.fetch_concurrency) {
            let email = match fetched {
                Ok(email) => email,
                Err(err) => {
                    skip_item(self.res.ctx, errors, id, err)?;
                    continue;
                }
            };

            match store_item(self.res.store, user_id, &email) {
                Ok(Stored::Created(local_id)) => {
                    progress.added += 1;
                    created.push(local_id);
                }
                Ok(Stored::Updated(_)) => progress.updated += 1,
                Err(err) => skip_item(self.res.ctx, errors, id, err)?,
            }
        }

        Ok(created)
    }
}
