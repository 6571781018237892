//! Downstream embedding queue
//!
//! Newly created items are handed to an embedding pipeline by local id.
//! Hand-off is best-effort: a failing queue is logged and never fails a sync.

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EmbeddingSettings;
use crate::context::SyncContext;
use crate::storage::LocalId;

/// Consumer of newly synced items
pub trait EmbeddingQueue: Send + Sync {
    fn enqueue(&self, user_id: &str, ids: &[LocalId]) -> Result<()>;

    /// Drop pending work and stored vectors for deleted items
    fn remove(&self, user_id: &str, ids: &[LocalId]) -> Result<()>;
}

/// Queue for deployments without an embedding pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardEmbeddingQueue;

impl EmbeddingQueue for DiscardEmbeddingQueue {
    fn enqueue(&self, user_id: &str, ids: &[LocalId]) -> Result<()> {
        log::debug!("Discarding {} embedding jobs for {}", ids.len(), user_id);
        Ok(())
    }

    fn remove(&self, _user_id: &str, _ids: &[LocalId]) -> Result<()> {
        Ok(())
    }
}

/// Queue that records what it was given (tests, dry runs)
#[derive(Default)]
pub struct InMemoryEmbeddingQueue {
    pending: Mutex<HashMap<String, BTreeSet<LocalId>>>,
    batches: Mutex<usize>,
}

impl InMemoryEmbeddingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, user_id: &str) -> Vec<LocalId> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of `enqueue` calls received
    pub fn batches(&self) -> usize {
        *self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EmbeddingQueue for InMemoryEmbeddingQueue {
    fn enqueue(&self, user_id: &str, ids: &[LocalId]) -> Result<()> {
        *self.batches.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_id.to_string())
            .or_default()
            .extend(ids.iter().copied());
        Ok(())
    }

    fn remove(&self, user_id: &str, ids: &[LocalId]) -> Result<()> {
        if let Some(pending) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(user_id)
        {
            for id in ids {
                pending.remove(id);
            }
        }
        Ok(())
    }
}

/// Splits hand-offs into batches with a short pause between them
#[derive(Clone)]
pub struct EmbeddingBatcher {
    queue: Arc<dyn EmbeddingQueue>,
    batch_size: usize,
    batch_delay: Duration,
}

impl EmbeddingBatcher {
    pub fn new(queue: Arc<dyn EmbeddingQueue>, settings: &EmbeddingSettings) -> Self {
        Self {
            queue,
            batch_size: settings.batch_size.max(1),
            batch_delay: Duration::from_millis(settings.batch_delay_ms),
        }
    }

    /// Queue newly created items; returns how many were accepted
    pub fn submit(&self, ctx: &SyncContext, ids: &[LocalId]) -> usize {
        let mut accepted = 0;
        for (i, batch) in ids.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.batch_delay.is_zero() {
                ctx.clock.sleep(self.batch_delay);
            }
            match self.queue.enqueue(&ctx.user_id, batch) {
                Ok(()) => accepted += batch.len(),
                Err(e) => ctx.log.warn(format_args!(
                    "Failed to queue {} items for embedding: {:#}",
                    batch.len(),
                    e
                )),
            }
        }
        accepted
    }

    /// Remove embedding state for deleted items
    pub fn remove(&self, ctx: &SyncContext, ids: &[LocalId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.queue.remove(&ctx.user_id, ids) {
            ctx.log.warn(format_args!(
                "Failed to remove embeddings for {} deleted items: {:#}",
                ids.len(),
                e
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::context::SyncLog;
    use chrono::Utc;

    struct BrokenQueue;

    impl EmbeddingQueue for BrokenQueue {
        fn enqueue(&self, _user_id: &str, _ids: &[LocalId]) -> Result<()> {
            anyhow::bail!("embedding service unavailable")
        }

        fn remove(&self, _user_id: &str, _ids: &[LocalId]) -> Result<()> {
            anyhow::bail!("embedding service unavailable")
        }
    }

    fn ctx() -> (SyncContext, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            SyncContext::new("u", &SyncLog::global("test"), clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_submit_batches_with_delay() {
        let queue = Arc::new(InMemoryEmbeddingQueue::new());
        let batcher = EmbeddingBatcher::new(
            queue.clone(),
            &EmbeddingSettings {
                batch_size: 2,
                batch_delay_ms: 100,
            },
        );
        let (ctx, clock) = ctx();
        let start = clock.now();

        assert_eq!(batcher.submit(&ctx, &[1, 2, 3, 4, 5]), 5);
        assert_eq!(queue.batches(), 3);
        assert_eq!(queue.pending("u"), vec![1, 2, 3, 4, 5]);
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(200));

        batcher.remove(&ctx, &[2, 4]);
        assert_eq!(queue.pending("u"), vec![1, 3, 5]);
    }

    #[test]
    fn test_failures_are_swallowed() {
        let batcher = EmbeddingBatcher::new(Arc::new(BrokenQueue), &EmbeddingSettings::default());
        let (ctx, _clock) = ctx();

        assert_eq!(batcher.submit(&ctx, &[1, 2, 3]), 0);
        batcher.remove(&ctx, &[1]);
    }
}
