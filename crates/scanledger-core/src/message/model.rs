//! Message data models.

use chrono::{DateTime, NaiveDateTime};
use scanledger_patch::Document;
use serde::{Deserialize, Serialize};

/// Read state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    /// The message has been read.
    Read,
    /// The message has not been read yet.
    Unread,
}

/// One timestamped message or event from the remote service.
///
/// `key` is the sole identity: the same key may arrive again with a new
/// `comment_count` or `status` and still mean the same message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    pub key: String,

    /// Creation timestamp string.
    pub created: String,

    /// Latest-activity timestamp string, preferred over `created` for
    /// ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,

    /// Sort key: negated epoch milliseconds, so descending-date order is
    /// ascending by `date`. Derived, never trusted from the wire.
    #[serde(default)]
    pub date: i64,

    /// Number of comments in this message's thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u32>,

    /// Read state, absent for streams that do not track it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReadStatus>,

    /// Category tag of the owning stream, as reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Opaque structured content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Document>,

    /// Plain-text body, when not nested inside `payload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Message {
    /// Derives the sort key from `activity` (preferred) or `created`.
    ///
    /// Unparseable timestamps sort last (`date` 0).
    pub fn derive_date(&mut self) {
        let raw = self.activity.as_deref().unwrap_or(&self.created);
        self.date = parse_epoch_millis(raw).map_or(0, |millis| -millis);
    }

    /// Body text for indexing, from `body` or `payload.body`.
    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref().or_else(|| {
            self.payload
                .as_ref()
                .and_then(|payload| payload.get("body"))
                .and_then(Document::as_str)
        })
    }
}

fn parse_epoch_millis(raw: &str) -> Option<i64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp_millis());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc().timestamp_millis());
    }
    None
}

/// A reconcilable message stream.
///
/// Comment threads are cached with the same structure as the top-level
/// streams, keyed by the owning message's key instead of a group tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageStream {
    /// Top-level game events.
    Events,
    /// Top-level conversations; cached entries may be superseded in place.
    Conversations,
    /// Comment thread of a single conversation.
    Thread(String),
}

impl MessageStream {
    /// Cache key (and store namespace suffix) for this stream.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        match self {
            Self::Events => "game_event",
            Self::Conversations => "game_diplomacy",
            Self::Thread(key) => key,
        }
    }

    /// Whether a status change marks an entry as changed during the overlap
    /// scan. Event read-state is not tracked.
    #[must_use]
    pub const fn tracks_status(&self) -> bool {
        !matches!(self, Self::Events)
    }

    /// Whether an updated entry replaces its cached predecessor in place.
    #[must_use]
    pub const fn supersedes_on_update(&self) -> bool {
        matches!(self, Self::Conversations)
    }

    /// Whether this is one of the top-level group streams.
    #[must_use]
    pub const fn is_top_level(&self) -> bool {
        !matches!(self, Self::Thread(_))
    }
}

impl std::fmt::Display for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.cache_key())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(key: &str, created: &str) -> Message {
        Message {
            key: key.to_string(),
            created: created.to_string(),
            activity: None,
            date: 0,
            comment_count: None,
            status: None,
            group: None,
            payload: None,
            body: None,
        }
    }

    #[test]
    fn date_is_negated_epoch_millis() {
        let mut older = message("a", "2026-01-01 00:00:00");
        let mut newer = message("b", "2026-01-02 00:00:00");
        older.derive_date();
        newer.derive_date();

        assert!(older.date < 0);
        // Most-recent-first means ascending by the derived key.
        assert!(newer.date < older.date);
    }

    #[test]
    fn activity_takes_precedence_over_created() {
        let mut bumped = message("a", "2026-01-01 00:00:00");
        bumped.activity = Some("2026-01-03 00:00:00".to_string());
        let mut plain = message("b", "2026-01-02 00:00:00");
        bumped.derive_date();
        plain.derive_date();

        assert!(bumped.date < plain.date);
    }

    #[test]
    fn unparseable_timestamps_sort_last() {
        let mut odd = message("a", "not a date");
        odd.derive_date();
        assert_eq!(odd.date, 0);
    }

    #[test]
    fn rfc3339_is_accepted() {
        let mut iso = message("a", "2026-01-01T12:00:00Z");
        iso.derive_date();
        assert!(iso.date < 0);
    }

    #[test]
    fn body_text_falls_back_to_payload() {
        let mut direct = message("a", "2026-01-01 00:00:00");
        direct.body = Some("hello there".to_string());
        assert_eq!(direct.body_text(), Some("hello there"));

        let mut nested = message("b", "2026-01-01 00:00:00");
        nested.payload = Some(json!({"subject": "x", "body": "from payload"}));
        assert_eq!(nested.body_text(), Some("from payload"));

        nested.body = Some("direct wins".to_string());
        assert_eq!(nested.body_text(), Some("direct wins"));
    }

    #[test]
    fn stream_traits_follow_the_kind() {
        assert!(!MessageStream::Events.tracks_status());
        assert!(MessageStream::Conversations.tracks_status());
        assert!(MessageStream::Thread("m".into()).tracks_status());

        assert!(MessageStream::Conversations.supersedes_on_update());
        assert!(!MessageStream::Events.supersedes_on_update());
        assert!(!MessageStream::Thread("m".into()).supersedes_on_update());

        assert_eq!(MessageStream::Thread("m-1".into()).cache_key(), "m-1");
    }

    #[test]
    fn wire_round_trip_keeps_optional_fields_sparse() {
        let mut original = message("a", "2026-01-01 00:00:00");
        original.comment_count = Some(2);
        original.status = Some(ReadStatus::Read);
        original.derive_date();

        let wire = serde_json::to_value(&original).unwrap();
        assert_eq!(wire["status"], json!("read"));
        assert!(wire.get("activity").is_none());

        let decoded: Message = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, original);
    }
}
