//! In-memory store for tests and demos.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use scanledger_patch::Document;
use tokio::sync::RwLock;

use super::{Store, StoreResult};

/// Volatile [`Store`] backed by nested maps.
///
/// Mirrors the persistent store's contract exactly, minus durability. Useful
/// for tests and demos; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held in `namespace`.
    pub async fn len(&self, namespace: &str) -> usize {
        let namespaces = self.namespaces.read().await;
        namespaces.get(namespace).map_or(0, BTreeMap::len)
    }

    /// Returns true when `namespace` holds no records.
    pub async fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace).await == 0
    }
}

impl Store for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Document>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .get(namespace)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: &Document) -> StoreResult<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        let mut namespaces = self.namespaces.write().await;
        if let Some(records) = namespaces.get_mut(namespace) {
            records.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> StoreResult<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces.remove(namespace);
        Ok(())
    }

    async fn get_all_ordered_by(&self, namespace: &str, field: &str) -> StoreResult<Vec<Document>> {
        let namespaces = self.namespaces.read().await;
        let mut records: Vec<Document> = namespaces
            .get(namespace)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| compare_field(a.get(field), b.get(field)));
        Ok(records)
    }
}

fn compare_field(a: Option<&Document>, b: Option<&Document>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => {
            if let (Some(nx), Some(ny)) = (x.as_f64(), y.as_f64()) {
                nx.total_cmp(&ny)
            } else {
                x.as_str().unwrap_or("").cmp(y.as_str().unwrap_or(""))
            }
        }
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    }
}
