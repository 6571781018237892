//! Classified sync errors
//!
//! Transport failures are classified exactly once, at the facade boundary,
//! into a [`SyncError`]. Everything downstream (orchestrators, worker, job
//! queue) reasons about the [`ErrorKind`] and never re-inspects raw errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Result alias used by the sync orchestrators and facade
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Error taxonomy for remote and pass-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Unauthorized,
    RateLimited,
    QuotaExceeded,
    NotFound,
    InvalidRequest,
    InsufficientPermission,
    NetworkError,
    Timeout,
    ServerError,
    Unknown,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may be retried
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::Unauthorized
            | ErrorKind::RateLimited
            | ErrorKind::QuotaExceeded
            | ErrorKind::NetworkError
            | ErrorKind::Timeout
            | ErrorKind::ServerError => true,
            ErrorKind::NotFound
            | ErrorKind::InvalidRequest
            | ErrorKind::InsufficientPermission
            | ErrorKind::Unknown => false,
        }
    }

    /// Base retry delay used when the server did not suggest one
    pub fn default_retry_delay(self) -> Duration {
        match self {
            ErrorKind::Unauthorized => Duration::from_millis(500),
            ErrorKind::RateLimited => Duration::from_secs(1),
            ErrorKind::QuotaExceeded => Duration::from_secs(5),
            ErrorKind::NetworkError | ErrorKind::Timeout | ErrorKind::ServerError => {
                Duration::from_secs(1)
            }
            _ => Duration::ZERO,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InsufficientPermission => "insufficient_permission",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified sync failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SyncError {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
    full_sync_required: bool,
}

impl SyncError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            full_sync_required: false,
        }
    }

    /// Attach a server-suggested retry delay
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// The stored cursor is unknown to the remote; only a full sync can recover
    pub fn cursor_expired(detail: impl fmt::Display) -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            message: format!("sync cursor expired, full sync required ({detail})"),
            retry_after: None,
            full_sync_required: true,
        }
    }

    /// No cursor has ever been stored for this user
    pub fn missing_cursor() -> Self {
        Self {
            kind: ErrorKind::InvalidRequest,
            message: "no sync cursor stored, full sync required".to_string(),
            retry_after: None,
            full_sync_required: true,
        }
    }

    pub fn rate_limit_timeout(waited: Duration) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            format!("quota not available after waiting {}ms", waited.as_millis()),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Set when the caller should schedule a full sync instead of retrying
    pub fn requires_full_sync(&self) -> bool {
        self.full_sync_required
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<SyncError>() {
            Ok(sync_err) => sync_err,
            Err(err) => SyncError::new(ErrorKind::Unknown, format!("{err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        for kind in [
            ErrorKind::Unauthorized,
            ErrorKind::RateLimited,
            ErrorKind::QuotaExceeded,
            ErrorKind::NetworkError,
            ErrorKind::Timeout,
            ErrorKind::ServerError,
        ] {
            assert!(kind.is_retryable(), "{kind} should be retryable");
        }
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::InvalidRequest,
            ErrorKind::InsufficientPermission,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.is_retryable(), "{kind} should not be retryable");
        }
    }

    #[test]
    fn test_cursor_expired_signal() {
        let err = SyncError::cursor_expired("404 from history");
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(!err.is_retryable());
        assert!(err.requires_full_sync());
        assert!(err.to_string().contains("full sync required"));
    }

    #[test]
    fn test_anyhow_round_trip_preserves_classification() {
        let original = SyncError::new(ErrorKind::NotFound, "gone");
        let wrapped: anyhow::Error = original.clone().into();
        assert_eq!(SyncError::from(wrapped), original);
    }

    #[test]
    fn test_unclassified_anyhow_is_unknown() {
        let err = SyncError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(err.message().contains("disk full"));
    }
}
