//! Per-component context carrying identity, logging and time
//!
//! Components never call the global `log` macros directly. They log through
//! the [`SyncLog`] carried in their [`SyncContext`], which tags each record
//! with the user it concerns and writes to an injected `log::Log` sink.

use std::fmt;
use std::sync::Arc;

use log::{Level, Log, Record};

use crate::clock::{Clock, SystemClock};

/// Structured logger handed to every component
#[derive(Clone)]
pub struct SyncLog {
    sink: &'static dyn Log,
    target: &'static str,
    user_id: Option<Arc<str>>,
}

impl SyncLog {
    /// Log through the process-wide `log` facade
    pub fn global(target: &'static str) -> Self {
        Self::with_sink(log::logger(), target)
    }

    /// Log through an explicit sink (used by tests to capture output)
    pub fn with_sink(sink: &'static dyn Log, target: &'static str) -> Self {
        Self {
            sink,
            target,
            user_id: None,
        }
    }

    /// Same sink, tagged with a user id
    pub fn for_user(&self, user_id: &str) -> Self {
        Self {
            sink: self.sink,
            target: self.target,
            user_id: Some(Arc::from(user_id)),
        }
    }

    /// Same sink and user, different target
    pub fn with_target(&self, target: &'static str) -> Self {
        Self {
            sink: self.sink,
            target,
            user_id: self.user_id.clone(),
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args);
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        if level > log::max_level() {
            return;
        }
        let user = self.user_id.as_deref().unwrap_or("-");
        self.sink.log(
            &Record::builder()
                .args(format_args!("[user={}] {}", user, args))
                .level(level)
                .target(self.target)
                .module_path_static(Some(module_path!()))
                .build(),
        );
    }
}

impl fmt::Debug for SyncLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncLog")
            .field("target", &self.target)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Identity, logging and time for one unit of sync work
#[derive(Clone)]
pub struct SyncContext {
    pub user_id: String,
    pub log: SyncLog,
    pub clock: Arc<dyn Clock>,
}

impl SyncContext {
    pub fn new(user_id: impl Into<String>, log: &SyncLog, clock: Arc<dyn Clock>) -> Self {
        let user_id = user_id.into();
        Self {
            log: log.for_user(&user_id),
            user_id,
            clock,
        }
    }

    /// Same context, logging under a different target
    pub fn with_target(mut self, target: &'static str) -> Self {
        self.log = self.log.with_target(target);
        self
    }

    /// Context using the global logger and wall-clock time
    pub fn system(user_id: impl Into<String>) -> Self {
        Self::new(user_id, &SyncLog::global("mailsync"), Arc::new(SystemClock))
    }
}
