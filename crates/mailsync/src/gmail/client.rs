//! Gmail API HTTP client
//!
//! Implements [`RemoteMailbox`] over the Gmail REST API. Uses synchronous
//! HTTP (ureq) to be executor-agnostic. Non-success statuses are returned as
//! raw [`RemoteError`]s carrying the status, the Google error reason and any
//! `Retry-After`; the facade decides what they mean.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::api::{
    ErrorResponse, GmailMessage, HistoryResponse, ListLabelsResponse, ListMessagesResponse,
    ProfileResponse,
};
use super::normalize::{history_to_delta, normalize_label, normalize_message};
use super::token::{TokenCache, TokenSource};
use crate::clock::Clock;
use crate::models::{Email, Label, MessageId};
use crate::remote::{
    DeltaPage, ItemIdPage, MailboxProvider, RemoteError, RemoteMailbox, TransportFailure,
};

/// Gmail API base URL
const BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Largest page the Gmail list endpoints accept
const MAX_PAGE_SIZE: u32 = 500;

const HISTORY_TYPES: [&str; 4] = ["messageAdded", "messageDeleted", "labelAdded", "labelRemoved"];

/// Gmail API client bound to one user
pub struct GmailClient {
    user_id: String,
    agent: ureq::Agent,
    base_url: Url,
    tokens: Arc<TokenCache>,
    source: Arc<dyn TokenSource>,
}

impl GmailClient {
    pub fn new(
        user_id: &str,
        agent: ureq::Agent,
        base_url: &Url,
        tokens: Arc<TokenCache>,
        source: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            agent,
            base_url: base_url.clone(),
            tokens,
            source,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| other_error(format!("Invalid Gmail base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Authorized GET returning the decoded JSON body
    fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, RemoteError> {
        let token = self
            .tokens
            .get(&self.user_id, self.source.as_ref())
            .map_err(|e| RemoteError::status(401, format!("{e:#}")))?;

        let mut response = self
            .agent
            .get(url.as_str())
            .header("Authorization", &format!("Bearer {}", token))
            .call()
            .map_err(|e| transport_error(e, what))?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return response
                .body_mut()
                .read_json()
                .map_err(|e| RemoteError::decode(format!("Failed to parse {what} response: {e}")));
        }

        if status == 401 {
            self.tokens.invalidate(&self.user_id);
        }
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = response.body_mut().read_to_string().unwrap_or_default();
        Err(status_error(status, &body, retry_after, what))
    }
}

impl RemoteMailbox for GmailClient {
    fn list_item_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ItemIdPage, RemoteError> {
        let mut url = self.endpoint(&["messages"])?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("maxResults", &page_size.clamp(1, MAX_PAGE_SIZE).to_string());
            if let Some(q) = query.filter(|q| !q.is_empty()) {
                params.append_pair("q", q);
            }
            if let Some(token) = page_token {
                params.append_pair("pageToken", token);
            }
        }

        let list: ListMessagesResponse = self.get_json(url, "list messages")?;
        Ok(ItemIdPage {
            ids: list
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|m| MessageId::new(m.id))
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    fn get_item(&self, id: &MessageId) -> Result<Email, RemoteError> {
        let mut url = self.endpoint(&["messages", id.as_str()])?;
        url.query_pairs_mut().append_pair("format", "full");

        let message: GmailMessage = self.get_json(url, "get message")?;
        normalize_message(message).map_err(|e| RemoteError::decode(format!("{e:#}")))
    }

    fn list_labels(&self) -> Result<Vec<Label>, RemoteError> {
        let url = self.endpoint(&["labels"])?;
        let labels: ListLabelsResponse = self.get_json(url, "list labels")?;
        Ok(labels
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(normalize_label)
            .collect())
    }

    fn get_current_cursor(&self) -> Result<String, RemoteError> {
        let url = self.endpoint(&["profile"])?;
        let profile: ProfileResponse = self.get_json(url, "get profile")?;
        Ok(profile.history_id)
    }

    fn list_delta_log(
        &self,
        from_cursor: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<DeltaPage, RemoteError> {
        let mut url = self.endpoint(&["history"])?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("startHistoryId", from_cursor);
            params.append_pair("maxResults", &max_results.clamp(1, MAX_PAGE_SIZE).to_string());
            for history_type in HISTORY_TYPES {
                params.append_pair("historyTypes", history_type);
            }
            if let Some(token) = page_token {
                params.append_pair("pageToken", token);
            }
        }

        let history: HistoryResponse = self.get_json(url, "list history")?;
        Ok(DeltaPage {
            entries: history_to_delta(history.history.unwrap_or_default()),
            next_page_token: history.next_page_token,
            new_cursor: history.history_id,
        })
    }
}

/// Hands out a [`GmailClient`] per user, sharing one HTTP agent and token cache
pub struct GmailMailboxProvider {
    agent: ureq::Agent,
    base_url: Url,
    tokens: Arc<TokenCache>,
    source: Arc<dyn TokenSource>,
}

impl GmailMailboxProvider {
    pub fn new(
        source: Arc<dyn TokenSource>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Result<Self> {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build();
        Ok(Self {
            agent: ureq::Agent::new_with_config(config),
            base_url: Url::parse(BASE_URL).context("Invalid Gmail base URL")?,
            tokens: Arc::new(TokenCache::new(clock)),
            source,
        })
    }

    /// Point the clients at another API root (e.g. a local test server)
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url).with_context(|| format!("Invalid base URL: {base_url}"))?;
        anyhow::ensure!(!url.cannot_be_a_base(), "Base URL cannot have paths: {base_url}");
        self.base_url = url;
        Ok(self)
    }
}

impl MailboxProvider for GmailMailboxProvider {
    fn mailbox(&self, user_id: &str) -> Result<Arc<dyn RemoteMailbox>> {
        Ok(Arc::new(GmailClient::new(
            user_id,
            self.agent.clone(),
            &self.base_url,
            self.tokens.clone(),
            self.source.clone(),
        )))
    }
}

fn other_error(message: String) -> RemoteError {
    RemoteError {
        failure: TransportFailure::Other,
        message,
    }
}

fn transport_error(err: ureq::Error, what: &str) -> RemoteError {
    let message = format!("Failed to send {what} request: {err}");
    match err {
        ureq::Error::Timeout(_) => RemoteError::timeout(message),
        ureq::Error::Io(_) | ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => {
            RemoteError::connection(message)
        }
        _ => other_error(message),
    }
}

/// Build a status error from a Google error envelope, if the body is one
fn status_error(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
    what: &str,
) -> RemoteError {
    let (reason, detail) = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => (
            parsed.error.errors.into_iter().find_map(|e| e.reason),
            parsed.error.message,
        ),
        Err(_) => (None, body.trim().chars().take(200).collect()),
    };
    RemoteError {
        failure: TransportFailure::Status {
            code: status,
            reason,
            retry_after,
        },
        message: format!("{what} failed with HTTP {status}: {detail}"),
    }
}

/// `Retry-After` as delta-seconds or an HTTP date
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO))
}
