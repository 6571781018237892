//! Shared wiring for sync passes
//!
//! [`SyncEngine`] owns the long-lived collaborators (mailbox provider,
//! stores, rate limiter, settings) and builds a per-user context, facade and
//! orchestrator for every pass.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncSettings;
use crate::context::{SyncContext, SyncLog};
use crate::downstream::{DiscardEmbeddingQueue, EmbeddingBatcher, EmbeddingQueue};
use crate::error::SyncResult;
use crate::facade::RemoteApi;
use crate::ratelimit::{InMemoryRateLimitStore, RateLimitStore, RateLimiter};
use crate::remote::MailboxProvider;
use crate::storage::{MailStore, SyncStateStore};
use crate::sync::{
    CursorFinding, FullSyncOrchestrator, FullSyncReport, IncrementalSyncOrchestrator,
    IncrementalSyncReport, MetadataSyncReport, SyncProgress, SyncResources, check_cursors,
    sync_metadata,
};

pub struct SyncEngine {
    provider: Arc<dyn MailboxProvider>,
    store: Arc<dyn MailStore>,
    states: Arc<dyn SyncStateStore>,
    embeddings: EmbeddingBatcher,
    limiter: Arc<RateLimiter>,
    settings: Arc<SyncSettings>,
    clock: Arc<dyn Clock>,
    log: SyncLog,
}

impl SyncEngine {
    pub fn builder(
        provider: Arc<dyn MailboxProvider>,
        store: Arc<dyn MailStore>,
        states: Arc<dyn SyncStateStore>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            provider,
            store,
            states,
            embeddings: None,
            rate_limit_store: None,
            settings: None,
            clock: None,
            log: None,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn states(&self) -> &Arc<dyn SyncStateStore> {
        &self.states
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    /// Context for work done on behalf of `user_id`
    pub fn context(&self, user_id: &str) -> SyncContext {
        SyncContext::new(user_id, &self.log, self.clock.clone())
    }

    /// Rate-limited facade over the user's remote mailbox
    pub fn api(&self, ctx: &SyncContext) -> SyncResult<RemoteApi> {
        let remote = self.provider.mailbox(&ctx.user_id)?;
        Ok(RemoteApi::new(
            remote,
            self.limiter.clone(),
            &self.settings,
            ctx.clone(),
        ))
    }

    pub fn full_sync(
        &self,
        user_id: &str,
        resume: bool,
        on_progress: &mut dyn FnMut(&SyncProgress),
    ) -> SyncResult<FullSyncReport> {
        let ctx = self.context(user_id).with_target("mailsync::sync::full");
        let api = self.api(&ctx)?;
        FullSyncOrchestrator::new(self.resources(&api, &ctx), &self.settings.full_sync)
            .run(resume, on_progress)
    }

    pub fn incremental_sync(
        &self,
        user_id: &str,
        on_progress: &mut dyn FnMut(&SyncProgress),
    ) -> SyncResult<IncrementalSyncReport> {
        let ctx = self
            .context(user_id)
            .with_target("mailsync::sync::incremental");
        let api = self.api(&ctx)?;
        IncrementalSyncOrchestrator::new(self.resources(&api, &ctx), &self.settings.incremental)
            .run(on_progress)
    }

    pub fn metadata_sync(&self, user_id: &str) -> SyncResult<MetadataSyncReport> {
        let ctx = self.context(user_id).with_target("mailsync::sync::metadata");
        let api = self.api(&ctx)?;
        sync_metadata(self.resources(&api, &ctx))
    }

    /// Assess every stored cursor against the expiry policy
    pub fn check_cursors(&self) -> SyncResult<Vec<CursorFinding>> {
        let states = self.states.list_sync_states()?;
        Ok(check_cursors(&states, self.clock.now(), &self.settings.cursor))
    }

    fn resources<'a>(&'a self, api: &'a RemoteApi, ctx: &'a SyncContext) -> SyncResources<'a> {
        SyncResources {
            api,
            store: self.store.as_ref(),
            states: self.states.as_ref(),
            embeddings: &self.embeddings,
            ctx,
        }
    }
}

/// Builder for [`SyncEngine`]; unset collaborators get in-process defaults
pub struct SyncEngineBuilder {
    provider: Arc<dyn MailboxProvider>,
    store: Arc<dyn MailStore>,
    states: Arc<dyn SyncStateStore>,
    embeddings: Option<Arc<dyn EmbeddingQueue>>,
    rate_limit_store: Option<Arc<dyn RateLimitStore>>,
    settings: Option<SyncSettings>,
    clock: Option<Arc<dyn Clock>>,
    log: Option<SyncLog>,
}

impl SyncEngineBuilder {
    pub fn embeddings(mut self, queue: Arc<dyn EmbeddingQueue>) -> Self {
        self.embeddings = Some(queue);
        self
    }

    pub fn rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limit_store = Some(store);
        self
    }

    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn log(mut self, log: SyncLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> SyncEngine {
        let settings = self.settings.unwrap_or_default();
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let rate_limit_store = self
            .rate_limit_store
            .unwrap_or_else(|| Arc::new(InMemoryRateLimitStore::new()));
        let queue = self
            .embeddings
            .unwrap_or_else(|| Arc::new(DiscardEmbeddingQueue));

        SyncEngine {
            provider: self.provider,
            store: self.store,
            states: self.states,
            embeddings: EmbeddingBatcher::new(queue, &settings.embeddings),
            limiter: Arc::new(RateLimiter::new(
                rate_limit_store,
                &settings.rate_limit,
                clock.clone(),
            )),
            settings: Arc::new(settings),
            clock,
            log: self.log.unwrap_or_else(|| SyncLog::global("mailsync")),
        }
    }
}
