//! OAuth2 access tokens for Gmail API calls
//!
//! The interactive consent flow is out of scope; a refresh token per user is
//! provisioned in `gmail-tokens.json` and exchanged for short-lived access
//! tokens. [`TokenCache`] makes sure concurrent callers for one user share a
//! single refresh.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::GmailCredentials;

/// Refresh-token file in the mailsync config directory (user id -> token)
const REFRESH_TOKENS_FILE: &str = "gmail-tokens.json";

/// Tokens this close to expiry are refreshed before use
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS)
    }
}

/// Issues access tokens for a user
pub trait TokenSource: Send + Sync {
    fn fetch_token(&self, user_id: &str) -> Result<AccessToken>;
}

type Slot = Arc<Mutex<Option<AccessToken>>>;

/// Single-flight access token cache keyed by user
///
/// The map lock is only held to find a user's slot. Refreshing happens under
/// the slot lock, so callers for the same user wait for one refresh while
/// other users proceed.
pub struct TokenCache {
    slots: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Cached token for `user_id`, refreshed through `source` when stale
    pub fn get(&self, user_id: &str, source: &dyn TokenSource) -> Result<String> {
        let slot = self.slot(user_id);
        let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(token) = cached.as_ref()
            && token.is_fresh(self.clock.now())
        {
            return Ok(token.token.clone());
        }

        log::debug!("Refreshing access token for {}", user_id);
        let token = source
            .fetch_token(user_id)
            .with_context(|| format!("Failed to obtain access token for {user_id}"))?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token, e.g. after the API rejected it
    pub fn invalidate(&self, user_id: &str) {
        let slot = self.slot(user_id);
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn slot(&self, user_id: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }
}

/// Token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Exchanges stored refresh tokens for access tokens
pub struct OAuthTokenSource {
    credentials: GmailCredentials,
    refresh_tokens: HashMap<String, String>,
    token_url: String,
    clock: Arc<dyn Clock>,
}

impl OAuthTokenSource {
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(
        credentials: GmailCredentials,
        refresh_tokens: HashMap<String, String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            credentials,
            refresh_tokens,
            token_url: Self::TOKEN_URL.to_string(),
            clock,
        }
    }

    /// Read refresh tokens from the config directory (none if the file is absent)
    pub fn load(credentials: GmailCredentials, clock: Arc<dyn Clock>) -> Result<Self> {
        let refresh_tokens = if config::config_exists(REFRESH_TOKENS_FILE) {
            config::load_json(REFRESH_TOKENS_FILE)?
        } else {
            HashMap::new()
        };
        Ok(Self::new(credentials, refresh_tokens, clock))
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.refresh_tokens.keys().map(String::as_str)
    }
}

impl TokenSource for OAuthTokenSource {
    fn fetch_token(&self, user_id: &str) -> Result<AccessToken> {
        let refresh_token = self
            .refresh_tokens
            .get(user_id)
            .with_context(|| format!("No refresh token stored for {user_id}"))?;

        let mut response = ureq::post(&self.token_url)
            .send_form([
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .context("Failed to refresh access token")?;

        let token: TokenResponse = response
            .body_mut()
            .read_json()
            .context("Failed to parse refresh token response")?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        Ok(AccessToken {
            token: token.access_token,
            expires_at: self.clock.now()
                + chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::hours(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        clock: Arc<ManualClock>,
    }

    impl TokenSource for CountingSource {
        fn fetch_token(&self, user_id: &str) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            // Widen the window in which other callers pile up
            std::thread::sleep(Duration::from_millis(20));
            Ok(AccessToken {
                token: format!("{user_id}-{n}"),
                expires_at: self.clock.now() + chrono::Duration::hours(1),
            })
        }
    }

    fn setup() -> (TokenCache, CountingSource, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            clock: clock.clone(),
        };
        (TokenCache::new(clock.clone()), source, clock)
    }

    #[test]
    fn test_concurrent_callers_share_one_refresh() {
        let (cache, source, _clock) = setup();

        let tokens: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| cache.get("alice", &source).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "alice-1"));
    }

    #[test]
    fn test_users_have_separate_tokens() {
        let (cache, source, _clock) = setup();
        assert_eq!(cache.get("alice", &source).unwrap(), "alice-1");
        assert_eq!(cache.get("bob", &source).unwrap(), "bob-2");
        assert_eq!(cache.get("alice", &source).unwrap(), "alice-1");
    }

    #[test]
    fn test_stale_or_invalidated_token_is_refreshed() {
        let (cache, source, clock) = setup();
        assert_eq!(cache.get("alice", &source).unwrap(), "alice-1");

        clock.advance(Duration::from_secs(56 * 60));
        assert_eq!(cache.get("alice", &source).unwrap(), "alice-2");

        cache.invalidate("alice");
        assert_eq!(cache.get("alice", &source).unwrap(), "alice-3");
    }

    #[test]
    fn test_unknown_user_has_no_refresh_token() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let source = OAuthTokenSource::new(
            GmailCredentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
            HashMap::new(),
            clock,
        );
        let err = source.fetch_token("nobody").unwrap_err();
        assert!(err.to_string().contains("No refresh token"));
    }
}
