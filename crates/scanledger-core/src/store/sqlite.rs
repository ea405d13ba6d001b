//! SQLite-backed store.

use scanledger_patch::Document;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::{Store, StoreResult};
use crate::StorageError;

/// Durable [`Store`] backed by a single SQLite table.
///
/// Records are stored as JSON text under `(namespace, key)`;
/// [`Store::get_all_ordered_by`] orders with `json_extract` over the stored
/// document, so any top-level field can act as an index.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Creates a store at the given database path.
    ///
    /// Creates the database and schema if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation
    /// fails.
    pub async fn new(database_path: &str) -> StoreResult<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation
    /// fails.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS records (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_records_namespace
            ON records(namespace)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn decode(namespace: &str, raw: &str) -> StoreResult<Document> {
        serde_json::from_str(raw).map_err(|source| StorageError::Codec {
            namespace: namespace.to_string(),
            source,
        })
    }
}

impl Store for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Document>> {
        let row = sqlx::query(r"SELECT value FROM records WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::decode(namespace, row.get("value")))
            .transpose()
    }

    async fn put(&self, namespace: &str, key: &str, value: &Document) -> StoreResult<()> {
        let encoded = serde_json::to_string(value).map_err(|source| StorageError::Codec {
            namespace: namespace.to_string(),
            source,
        })?;

        sqlx::query(
            r"
            INSERT INTO records (namespace, key, value)
            VALUES (?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value
            ",
        )
        .bind(namespace)
        .bind(key)
        .bind(encoded)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        sqlx::query(r"DELETE FROM records WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn clear(&self, namespace: &str) -> StoreResult<()> {
        sqlx::query(r"DELETE FROM records WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_all_ordered_by(&self, namespace: &str, field: &str) -> StoreResult<Vec<Document>> {
        let path = format!("$.{field}");
        let rows = sqlx::query(
            r"
            SELECT value FROM records
            WHERE namespace = ?
            ORDER BY json_extract(value, ?)
            ",
        )
        .bind(namespace)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::decode(namespace, row.get("value")))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();

        store
            .put("7:game_event", "msg-1", &json!({"date": -10, "key": "msg-1"}))
            .await
            .unwrap();

        let record = store.get("7:game_event", "msg-1").await.unwrap();
        assert_eq!(record, Some(json!({"date": -10, "key": "msg-1"})));
    }

    #[tokio::test]
    async fn put_replaces_on_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();

        store
            .put("7:game_event", "msg-1", &json!({"comment_count": 1}))
            .await
            .unwrap();
        store
            .put("7:game_event", "msg-1", &json!({"comment_count": 2}))
            .await
            .unwrap();

        let record = store.get("7:game_event", "msg-1").await.unwrap();
        assert_eq!(record, Some(json!({"comment_count": 2})));
    }

    #[tokio::test]
    async fn orders_by_extracted_field() {
        let store = SqliteStore::in_memory().await.unwrap();

        store
            .put("7:chain", "300", &json!({"timestamp": 300}))
            .await
            .unwrap();
        store
            .put("7:chain", "100", &json!({"timestamp": 100}))
            .await
            .unwrap();
        store
            .put("7:chain", "200", &json!({"timestamp": 200}))
            .await
            .unwrap();

        let records = store
            .get_all_ordered_by("7:chain", "timestamp")
            .await
            .unwrap();
        let timestamps: Vec<i64> = records
            .iter()
            .map(|r| r["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn clear_is_namespace_scoped() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.put("7:a", "x", &json!({"v": 1})).await.unwrap();
        store.put("7:b", "x", &json!({"v": 2})).await.unwrap();

        store.clear("7:a").await.unwrap();
        assert_eq!(store.get("7:a", "x").await.unwrap(), None);
        assert_eq!(store.get("7:b", "x").await.unwrap(), Some(json!({"v": 2})));
    }
}
