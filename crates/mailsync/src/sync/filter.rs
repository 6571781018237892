//! Which items a user has chosen to sync

use chrono::{DateTime, Duration, Utc};

use crate::models::{Email, Label, SyncConfig};

/// Include/exclude labels and an age cutoff derived from a [`SyncConfig`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    cutoff: Option<DateTime<Utc>>,
}

impl SyncFilter {
    pub fn from_config(config: &SyncConfig, now: DateTime<Utc>) -> Self {
        Self {
            include: config.sync_labels.clone(),
            exclude: config.exclude_labels.clone(),
            cutoff: config
                .max_email_age_days
                .map(|days| now - Duration::days(i64::from(days))),
        }
    }

    /// Whether an item belongs in the local store
    ///
    /// It must carry an included label (when any are configured), no
    /// excluded label, and be no older than the cutoff.
    pub fn should_include(&self, email: &Email) -> bool {
        let has = |label: &String| email.label_ids.iter().any(|l| l.eq_ignore_ascii_case(label));

        (self.include.is_empty() || self.include.iter().any(has))
            && !self.exclude.iter().any(has)
            && self.cutoff.is_none_or(|cutoff| email.received_at >= cutoff)
    }

    /// Remote search query selecting the same items, if any filter is set
    ///
    /// e.g. `{label:inbox label:work} -label:spam after:2025/01/31`
    pub fn to_query(&self) -> Option<String> {
        let mut parts = Vec::new();

        if !self.include.is_empty() {
            let terms: Vec<String> = self
                .include
                .iter()
                .map(|l| format!("label:{}", Label::query_term(l)))
                .collect();
            parts.push(format!("{{{}}}", terms.join(" ")));
        }
        parts.extend(
            self.exclude
                .iter()
                .map(|l| format!("-label:{}", Label::query_term(l))),
        );
        if let Some(cutoff) = self.cutoff {
            parts.push(format!("after:{}", cutoff.format("%Y/%m/%d")));
        }

        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageId, ThreadId};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn email(labels: &[&str], age_days: i64) -> Email {
        Email::builder(MessageId::new("m"), ThreadId::new("t"))
            .label_ids(labels.iter().copied())
            .received_at(now() - Duration::days(age_days))
            .build()
    }

    #[test]
    fn test_empty_config_includes_everything() {
        let filter = SyncFilter::from_config(&SyncConfig::default(), now());
        assert!(filter.should_include(&email(&[], 4000)));
        assert_eq!(filter.to_query(), None);
    }

    #[test]
    fn test_include_exclude_and_age() {
        let config = SyncConfig {
            sync_configured: true,
            sync_labels: vec!["INBOX".into(), "Label_7".into()],
            exclude_labels: vec!["SPAM".into()],
            max_email_age_days: Some(30),
        };
        let filter = SyncFilter::from_config(&config, now());

        assert!(filter.should_include(&email(&["INBOX"], 1)));
        assert!(filter.should_include(&email(&["Label_7", "UNREAD"], 29)));
        assert!(!filter.should_include(&email(&["SENT"], 1)));
        assert!(!filter.should_include(&email(&["INBOX", "SPAM"], 1)));
        assert!(!filter.should_include(&email(&["INBOX"], 31)));
    }

    #[test]
    fn test_query_syntax() {
        let config = SyncConfig {
            sync_configured: true,
            sync_labels: vec!["INBOX".into(), "Work Stuff".into()],
            exclude_labels: vec!["SPAM".into()],
            max_email_age_days: Some(28),
        };
        let filter = SyncFilter::from_config(&config, now());

        assert_eq!(
            filter.to_query().as_deref(),
            Some("{label:inbox label:work-stuff} -label:spam after:2025/02/01")
        );
    }
}
