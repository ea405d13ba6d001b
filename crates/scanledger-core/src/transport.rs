//! Abstract network transport and the request/response shapes it carries.

use scanledger_patch::Document;
use serde::Serialize;

use crate::store::SourceId;
use crate::TransportError;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Request path for fetching recent messages of a group.
pub const FETCH_MESSAGES_PATH: &str = "/game_api/fetch_game_messages";

/// Request path for fetching the comment thread of a message.
pub const FETCH_COMMENTS_PATH: &str = "/game_api/fetch_game_message_comments";

/// Abstract request/response call to the remote game API.
///
/// Timeouts and retries are the implementation's responsibility; the
/// reconcilers only require that an in-flight call eventually completes.
pub trait Transport: Send + Sync {
    /// Posts `body` to `path` and returns the response document.
    fn post(
        &self,
        path: &str,
        body: &Document,
    ) -> impl Future<Output = TransportResult<Document>> + Send;
}

/// Body of a paginated message fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchRequest {
    /// Operation name, mirrored in the request path.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Number of entries requested.
    pub count: usize,
    /// Page offset; reconciliation always reads from the head.
    pub offset: usize,
    /// Target group, for top-level streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Target message key, for comment threads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    /// Client protocol version.
    pub version: String,
    /// Game this request addresses.
    pub game_number: i64,
}

impl FetchRequest {
    /// Request for the most recent `count` messages of `group`.
    #[must_use]
    pub fn messages(group: &str, count: usize, version: &str, source: SourceId) -> Self {
        Self {
            kind: "fetch_game_messages",
            count,
            offset: 0,
            group: Some(group.to_string()),
            message_key: None,
            version: version.to_string(),
            game_number: source.0,
        }
    }

    /// Request for the most recent `count` comments of `message_key`.
    #[must_use]
    pub fn comments(message_key: &str, count: usize, version: &str, source: SourceId) -> Self {
        Self {
            kind: "fetch_game_message_comments",
            count,
            offset: 0,
            group: None,
            message_key: Some(message_key.to_string()),
            version: version.to_string(),
            game_number: source.0,
        }
    }

    /// Request path matching this request's kind.
    #[must_use]
    pub fn path(&self) -> &'static str {
        if self.message_key.is_some() {
            FETCH_COMMENTS_PATH
        } else {
            FETCH_MESSAGES_PATH
        }
    }

    /// Serializes the request into its wire document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_document(&self) -> serde_json::Result<Document> {
        serde_json::to_value(self)
    }
}

/// Extracts the `report.messages` list from a fetch response.
///
/// Some deployments answer with an array-shaped body whose second element is
/// the report; both shapes are accepted. `None` means the response carried no
/// usable data and the call must be treated as absent-data.
#[must_use]
pub fn report_messages(response: &Document) -> Option<&Document> {
    let report = response.get("report").or_else(|| response.get(1));
    report?.get("messages")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_request_wire_shape() {
        let request = FetchRequest::messages("game_event", 4, "2.1", SourceId(42));
        assert_eq!(request.path(), FETCH_MESSAGES_PATH);

        let wire = request.to_document().unwrap();
        assert_eq!(wire["type"], json!("fetch_game_messages"));
        assert_eq!(wire["count"], json!(4));
        assert_eq!(wire["offset"], json!(0));
        assert_eq!(wire["group"], json!("game_event"));
        assert_eq!(wire["game_number"], json!(42));
        assert!(wire.get("message_key").is_none());
    }

    #[test]
    fn comment_request_targets_thread() {
        let request = FetchRequest::comments("msg-7", 3, "2.1", SourceId(42));
        assert_eq!(request.path(), FETCH_COMMENTS_PATH);

        let wire = request.to_document().unwrap();
        assert_eq!(wire["message_key"], json!("msg-7"));
        assert!(wire.get("group").is_none());
    }

    #[test]
    fn report_extraction_handles_both_shapes() {
        let object = json!({"report": {"messages": [{"key": "a"}]}});
        assert!(report_messages(&object).is_some());

        let array = json!(["ok", {"messages": [{"key": "a"}]}]);
        assert!(report_messages(&array).is_some());

        let empty = json!({"status": "ok"});
        assert!(report_messages(&empty).is_none());
    }
}
