use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use serde_json::Value;

use super::StateStore;
use crate::{
    database::{connect_sqlite, ensure_schema},
    error::StoreError,
};

const SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"];

/// Durable [`StateStore`] on a single SQLite `kv` table. Values are stored
/// as JSON text; compare-and-set compares that text.
pub struct SqliteStateStore {
    db: DatabaseConnection,
}

impl SqliteStateStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let db = connect_sqlite(url).await?;
        Self::new(db).await
    }

    pub async fn new(db: DatabaseConnection) -> Result<Self, StoreError> {
        ensure_schema(&db, SCHEMA).await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT value FROM kv WHERE key = ?",
                [key.into()],
            ))
            .await?;
        match row {
            Some(row) => {
                let text: String = row.try_get("", "value")?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key.into(), serde_json::to_string(&value)?.into()],
            ))
            .await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> Result<bool, StoreError> {
        let new = serde_json::to_string(&new)?;
        let stmt = match expected {
            None => Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT OR IGNORE INTO kv (key, value) VALUES (?, ?)",
                [key.into(), new.into()],
            ),
            Some(expected) => Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE kv SET value = ? WHERE key = ? AND value = ?",
                [
                    new.into(),
                    key.into(),
                    serde_json::to_string(expected)?.into(),
                ],
            ),
        };
        let result = self.db.execute(stmt).await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{advance_max, get_u64};
    use serde_json::json;

    async fn temp_store() -> (tempfile::TempDir, SqliteStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("state.db").display());
        let store = SqliteStateStore::connect(&url).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn get_set_roundtrip() {
        let (_dir, store) = temp_store().await;
        assert_eq!(store.get("missing").await.unwrap(), None);
        store.set("k", json!({"a": [1, 2]})).await.unwrap();
        store.set("k", json!({"a": [3]})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": [3]})));
    }

    #[tokio::test]
    async fn compare_and_set_semantics() {
        let (_dir, store) = temp_store().await;
        assert!(store.compare_and_set("k", None, json!("v1")).await.unwrap());
        assert!(!store.compare_and_set("k", None, json!("v2")).await.unwrap());

        let current = store.get("k").await.unwrap();
        assert!(
            store
                .compare_and_set("k", current.as_ref(), json!("v2"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_set("k", current.as_ref(), json!("v3"))
                .await
                .unwrap()
        );
        assert_eq!(store.get("k").await.unwrap(), Some(json!("v2")));
    }

    #[tokio::test]
    async fn checkpoints_survive_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("state.db").display());
        {
            let store = SqliteStateStore::connect(&url).await.unwrap();
            advance_max(&store, "checkpoint:solana", 420).await.unwrap();
        }
        let store = SqliteStateStore::connect(&url).await.unwrap();
        assert_eq!(get_u64(&store, "checkpoint:solana").await.unwrap(), Some(420));
    }

    #[tokio::test]
    async fn in_memory_store_is_shared_across_queries() {
        let store = SqliteStateStore::connect("sqlite::memory:").await.unwrap();
        let keys: Vec<String> = (0..8).map(|i| format!("k{i}")).collect();
        let writes = (0..8).map(|i| store.set(&keys[i], json!(i)));
        futures::future::try_join_all(writes).await.unwrap();

        let reads = (0..8).map(|i| store.get(&keys[i]));
        let values = futures::future::try_join_all(reads).await.unwrap();
        assert_eq!(values, (0..8).map(|i| Some(json!(i))).collect::<Vec<_>>());
    }
}
