//! Simulated remote mailbox
//!
//! Behaves like a small Gmail account: items are listed in pages, every
//! mutation is appended to a delta log under a monotonically increasing
//! history id, and old history can be expired to simulate cursor expiry.
//! Failures can be injected per operation or per item.

use chrono::{NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{DeltaPage, ItemIdPage, RemoteError, RemoteMailbox};
use crate::models::{DeltaEntry, Email, Label, MessageId};
use crate::ratelimit::Operation;

/// A failure scheduled for a future call
struct InjectedFailure {
    operation: Operation,
    /// Calls of `operation` still allowed to succeed before this one fires
    skip: usize,
    error: RemoteError,
}

#[derive(Default)]
struct Inner {
    /// Items in listing order
    order: Vec<MessageId>,
    items: HashMap<MessageId, Email>,
    labels: Vec<Label>,
    /// (history id, entry)
    history: Vec<(u64, DeltaEntry)>,
    history_id: u64,
    /// Cursors older than this are rejected as expired
    oldest_valid_cursor: u64,
    failures: VecDeque<InjectedFailure>,
    item_failures: HashMap<MessageId, RemoteError>,
    calls: HashMap<Operation, usize>,
}

impl Inner {
    fn record(&mut self, entry: DeltaEntry) {
        self.history_id += 1;
        let position = self.history_id;
        self.history.push((position, entry.at(position.to_string())));
    }

    /// Count the call and fire an injected failure if one is due
    fn enter(&mut self, operation: Operation) -> Result<(), RemoteError> {
        *self.calls.entry(operation).or_default() += 1;

        let mut fired = None;
        for (i, failure) in self.failures.iter_mut().enumerate() {
            if failure.operation != operation {
                continue;
            }
            if failure.skip == 0 {
                fired = Some(i);
                break;
            }
            failure.skip -= 1;
        }

        match fired.and_then(|i| self.failures.remove(i)) {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }
}

/// In-memory stand-in for a remote mailbox
pub struct InMemoryMailbox {
    inner: Mutex<Inner>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                history_id: 1_000,
                oldest_valid_cursor: 0,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Populate the mailbox without writing delta-log entries
    pub fn seed(&self, emails: impl IntoIterator<Item = Email>) {
        let mut inner = self.lock();
        for email in emails {
            if !inner.items.contains_key(&email.id) {
                inner.order.push(email.id.clone());
            }
            inner.items.insert(email.id.clone(), email);
        }
        inner.history_id += 1;
    }

    pub fn set_labels(&self, labels: Vec<Label>) {
        self.lock().labels = labels;
    }

    /// Deliver a new item, recording it in the delta log
    pub fn deliver(&self, email: Email) {
        let mut inner = self.lock();
        let id = email.id.clone();
        if !inner.items.contains_key(&id) {
            inner.order.push(id.clone());
        }
        inner.items.insert(id.clone(), email);
        inner.record(DeltaEntry::added(id));
    }

    /// Delete an item, recording it in the delta log
    pub fn delete(&self, id: &str) {
        let mut inner = self.lock();
        let id = MessageId::new(id);
        inner.items.remove(&id);
        inner.order.retain(|m| m != &id);
        inner.record(DeltaEntry::deleted(id));
    }

    pub fn add_labels(&self, id: &str, labels: &[&str]) {
        let mut inner = self.lock();
        let id = MessageId::new(id);
        if let Some(email) = inner.items.get_mut(&id) {
            for label in labels {
                if !email.has_label(label) {
                    email.label_ids.push(label.to_string());
                }
            }
        }
        inner.record(DeltaEntry::labels_added(id));
    }

    pub fn remove_labels(&self, id: &str, labels: &[&str]) {
        let mut inner = self.lock();
        let id = MessageId::new(id);
        if let Some(email) = inner.items.get_mut(&id) {
            email.label_ids.retain(|l| !labels.contains(&l.as_str()));
        }
        inner.record(DeltaEntry::labels_removed(id));
    }

    /// Append a raw delta-log entry without touching items
    pub fn push_delta(&self, entry: DeltaEntry) {
        self.lock().record(entry);
    }

    /// Reject every cursor issued so far, as if history had been purged
    pub fn expire_history(&self) {
        let mut inner = self.lock();
        inner.oldest_valid_cursor = inner.history_id + 1;
        inner.history.clear();
    }

    /// Fail the `(skip + 1)`-th upcoming call of `operation` once
    pub fn fail_call(&self, operation: Operation, skip: usize, error: RemoteError) {
        self.lock().failures.push_back(InjectedFailure {
            operation,
            skip,
            error,
        });
    }

    /// Make every fetch of `id` fail
    pub fn fail_item(&self, id: &str, error: RemoteError) {
        self.lock().item_failures.insert(MessageId::new(id), error);
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_cursor(&self) -> String {
        self.lock().history_id.to_string()
    }
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteMailbox for InMemoryMailbox {
    fn list_item_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ItemIdPage, RemoteError> {
        let mut inner = self.lock();
        inner.enter(Operation::ListMessages)?;

        let filter = query.map(QueryFilter::parse).unwrap_or_default();
        let offset: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| RemoteError::status(400, format!("Invalid pageToken: {token}")))?,
            None => 0,
        };

        let matching: Vec<MessageId> = inner
            .order
            .iter()
            .filter(|id| inner.items.get(*id).is_some_and(|e| filter.matches(e)))
            .cloned()
            .collect();

        let end = (offset + page_size as usize).min(matching.len());
        let ids = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < matching.len()).then(|| end.to_string());

        Ok(ItemIdPage {
            ids,
            next_page_token,
        })
    }

    fn get_item(&self, id: &MessageId) -> Result<Email, RemoteError> {
        let mut inner = self.lock();
        inner.enter(Operation::GetMessage)?;

        if let Some(error) = inner.item_failures.get(id) {
            return Err(error.clone());
        }
        inner
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::status(404, format!("Message {id} not found")))
    }

    fn list_labels(&self) -> Result<Vec<Label>, RemoteError> {
        let mut inner = self.lock();
        inner.enter(Operation::ListLabels)?;
        Ok(inner.labels.clone())
    }

    fn get_current_cursor(&self) -> Result<String, RemoteError> {
        let mut inner = self.lock();
        inner.enter(Operation::GetProfile)?;
        Ok(inner.history_id.to_string())
    }

    fn list_delta_log(
        &self,
        from_cursor: &str,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<DeltaPage, RemoteError> {
        let mut inner = self.lock();
        inner.enter(Operation::ListHistory)?;

        let from: u64 = from_cursor
            .parse()
            .map_err(|_| RemoteError::status(400, format!("Invalid startHistoryId: {from_cursor}")))?;
        if from < inner.oldest_valid_cursor {
            return Err(RemoteError::status(404, "Requested entity was not found."));
        }

        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let pending: Vec<DeltaEntry> = inner
            .history
            .iter()
            .filter(|(position, _)| *position > from)
            .map(|(_, entry)| entry.clone())
            .collect();

        let end = (offset + max_results as usize).min(pending.len());
        let entries = pending.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < pending.len()).then(|| end.to_string());

        Ok(DeltaPage {
            entries,
            next_page_token,
            new_cursor: Some(inner.history_id.to_string()),
        })
    }
}

/// The subset of Gmail search syntax produced by the sync filter
#[derive(Debug, Default)]
struct QueryFilter {
    any_of: Vec<String>,
    none_of: Vec<String>,
    after: Option<chrono::DateTime<Utc>>,
}

impl QueryFilter {
    fn parse(query: &str) -> Self {
        let mut filter = QueryFilter::default();
        for token in query.split_whitespace() {
            let token = token.trim_matches(|c| c == '{' || c == '}');
            if let Some(label) = token.strip_prefix("-label:") {
                filter.none_of.push(label.to_string());
            } else if let Some(label) = token.strip_prefix("label:") {
                filter.any_of.push(label.to_string());
            } else if let Some(date) = token.strip_prefix("after:") {
                filter.after = NaiveDate::parse_from_str(date, "%Y/%m/%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| Utc.from_utc_datetime(&dt));
            }
        }
        filter
    }

    fn matches(&self, email: &Email) -> bool {
        let terms: Vec<String> = email
            .label_ids
            .iter()
            .map(|l| Label::query_term(l))
            .collect();

        (self.any_of.is_empty() || self.any_of.iter().any(|l| terms.contains(l)))
            && !self.none_of.iter().any(|l| terms.contains(l))
            && self.after.is_none_or(|after| email.received_at >= after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ThreadId;

    fn email(id: &str, labels: &[&str]) -> Email {
        Email::builder(MessageId::new(id), ThreadId::new(format!("t-{id}")))
            .label_ids(labels.iter().copied())
            .build()
    }

    #[test]
    fn test_pagination() {
        let mailbox = InMemoryMailbox::new();
        mailbox.seed((0..5).map(|i| email(&format!("m{i}"), &["INBOX"])));

        let first = mailbox.list_item_ids(None, None, 2).unwrap();
        assert_eq!(first.ids.len(), 2);
        let token = first.next_page_token.unwrap();

        let second = mailbox.list_item_ids(None, Some(&token), 2).unwrap();
        let third = mailbox
            .list_item_ids(None, second.next_page_token.as_deref(), 2)
            .unwrap();
        assert_eq!(third.ids, vec![MessageId::new("m4")]);
        assert!(third.next_page_token.is_none());
    }

    #[test]
    fn test_query_filter() {
        let mailbox = InMemoryMailbox::new();
        mailbox.seed([
            email("a", &["INBOX"]),
            email("b", &["INBOX", "SPAM"]),
            email("c", &["Label_1"]),
        ]);

        let page = mailbox
            .list_item_ids(Some("{label:inbox} -label:spam"), None, 10)
            .unwrap();
        assert_eq!(page.ids, vec![MessageId::new("a")]);
    }

    #[test]
    fn test_delta_log_positions() {
        let mailbox = InMemoryMailbox::new();
        let start = mailbox.current_cursor();
        mailbox.deliver(email("a", &["INBOX"]));
        mailbox.delete("a");

        let page = mailbox.list_delta_log(&start, None, 10).unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.new_cursor, Some(mailbox.current_cursor()));
        assert_eq!(page.entries[1].position, Some(mailbox.current_cursor()));
    }

    #[test]
    fn test_expired_history_is_not_found() {
        let mailbox = InMemoryMailbox::new();
        let cursor = mailbox.current_cursor();
        mailbox.expire_history();

        let err = mailbox.list_delta_log(&cursor, None, 10).unwrap_err();
        assert!(matches!(
            err.failure,
            super::super::TransportFailure::Status { code: 404, .. }
        ));
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let mailbox = InMemoryMailbox::new();
        mailbox.fail_call(Operation::ListLabels, 1, RemoteError::status(500, "boom"));

        assert!(mailbox.list_labels().is_ok());
        assert!(mailbox.list_labels().is_err());
        assert!(mailbox.list_labels().is_ok());
        assert_eq!(mailbox.calls(Operation::ListLabels), 3);
    }
}
