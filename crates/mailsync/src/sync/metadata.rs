//! Metadata-only sync
//!
//! Refreshes the label catalogue for users who have not configured item sync
//! yet, so they can pick labels to sync. The cursor is never touched.

use serde::Serialize;

use super::SyncResources;
use crate::error::SyncResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetadataSyncReport {
    pub labels: usize,
}

pub fn sync_metadata(res: SyncResources<'_>) -> SyncResult<MetadataSyncReport> {
    let ctx = res.ctx;
    let mut state = res.states.load_or_default(&ctx.user_id)?;
    state.begin();
    res.states.save_sync_state(&state)?;

    let outcome = res.api.list_labels().and_then(|labels| {
        res.store.replace_labels(&ctx.user_id, &labels)?;
        Ok(labels.len())
    });

    match outcome {
        Ok(count) => {
            state.label_count = count as u64;
            state.succeed(ctx.clock.now());
            res.states.save_sync_state(&state)?;
            ctx.log
                .info(format_args!("Metadata sync complete: {} labels", count));
            Ok(MetadataSyncReport { labels: count })
        }
        Err(err) => {
            ctx.log.error(format_args!("Metadata sync failed: {}", err));
            state.fail(err.to_string());
            if let Err(e) = res.states.save_sync_state(&state) {
                ctx.log
                    .error(format_args!("Failed to record sync failure: {:#}", e));
            }
            Err(err)
        }
    }
}
