//! Diff-chain entry model.

use scanledger_patch::{Document, Patch};
use serde::{Deserialize, Serialize};

/// One position in a snapshot diff chain.
///
/// Neighbor wiring is index arithmetic over the owning chain's arena; entries
/// carry no positional references, so the persisted record is exactly this
/// struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Authoritative server timestamp of this snapshot.
    pub timestamp: i64,

    /// Fully materialized snapshot. Present only at home positions (index 0,
    /// the tail, and the last-accessed position); evicted everywhere else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<Document>,

    /// Patch from the previous entry's snapshot to this one. Absent at
    /// index 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<Patch>,

    /// Patch from this entry's snapshot back to the previous one. Absent at
    /// index 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back: Option<Patch>,
}

impl DiffEntry {
    /// Seed entry holding a full snapshot with no neighbors.
    #[must_use]
    pub fn seed(timestamp: i64, snapshot: Document) -> Self {
        Self {
            timestamp,
            cached: Some(snapshot),
            forward: None,
            back: None,
        }
    }

    /// Serializes the entry into its persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_document(&self) -> serde_json::Result<Document> {
        serde_json::to_value(self)
    }

    /// Decodes a persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not describe a diff entry.
    pub fn from_document(doc: &Document) -> serde_json::Result<Self> {
        serde_json::from_value(doc.clone())
    }
}
