//! Abstract persistent key-value store.
//!
//! The reconcilers treat persistence as a namespaced get/put/delete/clear
//! store keyed by string. Namespaces follow `{source}:{key}` for scan chains
//! and `{source}:{stream}` for message caches.

use scanledger_patch::Document;
use serde::{Deserialize, Serialize};

use crate::StorageError;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StorageError>;

/// Identifier of the remote game a cache belongs to.
///
/// Every namespace the reconcilers touch is scoped by this id, so caches for
/// distinct games never collide in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub i64);

impl SourceId {
    /// Store namespace for `key` under this source.
    #[must_use]
    pub fn namespace(&self, key: &str) -> String {
        format!("{}:{key}", self.0)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Abstract namespaced key-value store.
///
/// All operations suspend the calling task; none block. Implementations must
/// tolerate unknown namespaces (reads return empty, deletes are no-ops).
pub trait Store: Send + Sync {
    /// Fetches the record at `key` in `namespace`, if present.
    fn get(
        &self,
        namespace: &str,
        key: &str,
    ) -> impl Future<Output = StoreResult<Option<Document>>> + Send;

    /// Inserts or replaces the record at `key` in `namespace`.
    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &Document,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Removes the record at `key` in `namespace`, if present.
    fn delete(&self, namespace: &str, key: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Removes every record in `namespace`.
    fn clear(&self, namespace: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// All records in `namespace`, ordered ascending by the given top-level
    /// field of the stored document.
    fn get_all_ordered_by(
        &self,
        namespace: &str,
        field: &str,
    ) -> impl Future<Output = StoreResult<Vec<Document>>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_source_scoped() {
        let source = SourceId(5_001_234);
        assert_eq!(source.namespace("api-key-1"), "5001234:api-key-1");
        assert_eq!(source.namespace("game_event"), "5001234:game_event");
    }
}
