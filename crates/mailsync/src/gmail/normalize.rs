//! Gmail API response normalization
//!
//! Converts Gmail API responses to sync domain models.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{TimeZone, Utc};

use super::api::{GmailLabel, GmailMessage, HistoryRecord, MessagePart, MessagePayload};
use crate::models::{DeltaEntry, Email, EmailAddress, Label, MessageId, ThreadId};

/// Normalize a Gmail API message (fetched with `format=full`)
pub fn normalize_message(gmail_msg: GmailMessage) -> Result<Email> {
    let payload = gmail_msg
        .payload
        .as_ref()
        .with_context(|| format!("Message {} has no payload", gmail_msg.id))?;

    let from = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com"));
    let to = extract_header(payload, "To")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();
    let cc = extract_header(payload, "Cc")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();
    let subject = extract_header(payload, "Subject").unwrap_or_default();

    // internalDate is milliseconds since epoch
    let internal_date: i64 = gmail_msg.internal_date.parse().unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    let body_text = extract_plain_text_body(payload);
    let snippet = if gmail_msg.snippet.is_empty() {
        body_text
            .as_deref()
            .map(|b| b.chars().take(200).collect())
            .unwrap_or_default()
    } else {
        decode_html_entities(&gmail_msg.snippet)
    };

    Ok(
        Email::builder(MessageId::new(gmail_msg.id), ThreadId::new(gmail_msg.thread_id))
            .from(from)
            .to(to)
            .cc(cc)
            .subject(subject)
            .snippet(snippet)
            .body_text(body_text)
            .received_at(received_at)
            .label_ids(gmail_msg.label_ids.unwrap_or_default())
            .build(),
    )
}

pub fn normalize_label(label: GmailLabel) -> Label {
    if label.label_type.as_deref() == Some("system") {
        Label::system(label.id, label.name)
    } else {
        Label::new(label.id, label.name)
    }
}

/// Flatten history records into delta entries, in log order
///
/// Every entry carries the id of the record it came from as its position.
pub fn history_to_delta(records: Vec<HistoryRecord>) -> Vec<DeltaEntry> {
    let mut entries = Vec::new();
    for record in records {
        let position = record.id;
        for change in record.messages_added {
            entries.push(DeltaEntry::added(change.message.id).at(position.clone()));
        }
        for change in record.messages_deleted {
            entries.push(DeltaEntry::deleted(change.message.id).at(position.clone()));
        }
        for change in record.labels_added {
            entries.push(DeltaEntry::labels_added(change.message.id).at(position.clone()));
        }
        for change in record.labels_removed {
            entries.push(DeltaEntry::labels_removed(change.message.id).at(position.clone()));
        }
    }
    entries
}

fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn parse_address_list(s: &str) -> Vec<EmailAddress> {
    s.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(EmailAddress::parse)
        .collect()
}

fn is_plain_text(mime_type: Option<&String>) -> bool {
    mime_type.is_some_and(|m| m.starts_with("text/plain"))
}

fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    if is_plain_text(payload.mime_type.as_ref())
        && let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_ref())
    {
        return decode_base64_body(data);
    }

    if let Some(parts) = &payload.parts
        && let Some(text) = find_plain_text_in_parts(parts)
    {
        return Some(text);
    }

    // Single-part message of another text type
    payload
        .body
        .as_ref()
        .and_then(|b| b.data.as_ref())
        .and_then(|data| decode_base64_body(data))
}

fn find_plain_text_in_parts(parts: &[MessagePart]) -> Option<String> {
    for part in parts {
        if is_plain_text(part.mime_type.as_ref())
            && let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref())
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_plain_text_in_parts(nested)
        {
            return Some(text);
        }
    }
    None
}

/// Gmail uses URL-safe base64 but padding varies
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders
        .iter()
        .filter_map(|decoder| decoder.decode(data).ok())
        .find_map(|bytes| String::from_utf8(bytes).ok())
}

fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
