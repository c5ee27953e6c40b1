//! Persistence for Core records.
//!
//! Records are stored as serialized JSON keyed by Core id. The SQLite backend
//! uses a single table:
//!
//! ```sql
//! CREATE TABLE cores (id TEXT PRIMARY KEY NOT NULL, settings TEXT);
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use super::Core;

/// Path that opens a private in-memory SQLite database.
pub const SQLITE_MEMORY: &str = ":memory:";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cores (
    id TEXT PRIMARY KEY NOT NULL,
    settings TEXT
);
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO cores (id, settings)
VALUES (?1, ?2)
ON CONFLICT(id)
DO UPDATE SET settings = excluded.settings;
"#;

const LOOKUP_SQL: &str = r#"
SELECT settings
FROM cores
WHERE id = ?1;
"#;

const LIST_SQL: &str = r#"
SELECT id, settings
FROM cores
ORDER BY id;
"#;

const DELETE_SQL: &str = r#"
DELETE FROM cores
WHERE id = ?1;
"#;

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    /// A record could not be encoded.
    #[error("failed to encode core {id}: {source}")]
    Encode {
        /// Core id
        id: Uuid,
        /// Serializer error
        source: serde_json::Error,
    },

    /// A stored record is not a valid Core.
    #[error("corrupt record for core {id}: {source}")]
    Decode {
        /// Stored id
        id: String,
        /// Deserializer error
        source: serde_json::Error,
    },
}

/// Keyed storage of Core records.
#[async_trait]
pub trait CoreStore: Send + Sync + 'static {
    /// Insert or replace the record for `core.id`.
    async fn upsert(&self, core: &Core) -> Result<(), StoreError>;

    /// Record for `id`, if any.
    async fn get(&self, id: Uuid) -> Result<Option<Core>, StoreError>;

    /// Every record.
    async fn list(&self) -> Result<Vec<Core>, StoreError>;

    /// Remove `id`; `false` if it was not present.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCoreStore {
    cores: RwLock<HashMap<Uuid, Core>>,
}

impl MemoryCoreStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoreStore for MemoryCoreStore {
    async fn upsert(&self, core: &Core) -> Result<(), StoreError> {
        self.cores.write().insert(core.id, core.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Core>, StoreError> {
        Ok(self.cores.read().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Core>, StoreError> {
        let mut cores: Vec<Core> = self.cores.read().values().cloned().collect();
        cores.sort_by_key(|core| core.id);
        Ok(cores)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.cores.write().remove(&id).is_some())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// SQLite-backed store.
pub struct SqliteCoreStore {
    connection: Connection,
}

impl SqliteCoreStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the file cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let connection = if path == SQLITE_MEMORY {
            Connection::open_in_memory().await?
        } else {
            Connection::open(path).await?
        };
        connection
            .call(|connection| {
                connection.execute_batch(SCHEMA_SQL)?;
                Ok(())
            })
            .await?;
        info!(path, "Core store opened");
        Ok(Self { connection })
    }
}

fn decode(id: String, settings: &str) -> Result<Core, StoreError> {
    serde_json::from_str(settings).map_err(|source| StoreError::Decode { id, source })
}

#[async_trait]
impl CoreStore for SqliteCoreStore {
    async fn upsert(&self, core: &Core) -> Result<(), StoreError> {
        let record = serde_json::to_string(core).map_err(|source| StoreError::Encode {
            id: core.id,
            source,
        })?;
        let id = core.id.to_string();
        self.connection
            .call(move |connection| {
                connection.execute(UPSERT_SQL, rusqlite::params![id, record])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Core>, StoreError> {
        let key = id.to_string();
        let settings = self
            .connection
            .call(move |connection| {
                let mut statement = connection.prepare_cached(LOOKUP_SQL)?;
                let settings: Option<Option<String>> = statement
                    .query_row([key], |row| row.get("settings"))
                    .optional()?;
                Ok(settings.flatten())
            })
            .await?;
        settings
            .map(|settings| decode(id.to_string(), &settings))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Core>, StoreError> {
        let rows = self
            .connection
            .call(|connection| {
                let mut statement = connection.prepare_cached(LIST_SQL)?;
                let rows = statement
                    .query_map([], |row| {
                        Ok((row.get::<_, String>("id")?, row.get::<_, Option<String>>("settings")?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .filter_map(|(id, settings)| settings.map(|s| (id, s)))
            .map(|(id, settings)| decode(id, &settings))
            .collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let key = id.to_string();
        let removed = self
            .connection
            .call(move |connection| {
                let removed = connection.execute(DELETE_SQL, rusqlite::params![key])?;
                Ok(removed)
            })
            .await?;
        Ok(removed > 0)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CoreState;
    use serde_json::json;

    fn core() -> Core {
        Core {
            id: Uuid::new_v4(),
            state: CoreState::Created,
            parameters: json!({ "mcc": "001", "slices": [{ "sst": 1 }] }),
            network_functions: Vec::new(),
        }
    }

    async fn operations(store: &dyn CoreStore) {
        let mut record = core();
        assert!(store.get(record.id).await.unwrap().is_none());

        store.upsert(&record).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap(), Some(record.clone()));

        record.state = CoreState::Deployed;
        store.upsert(&record).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, CoreState::Deployed);

        assert!(store.delete(record.id).await.unwrap());
        assert!(!store.delete(record.id).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_operations() {
        operations(&MemoryCoreStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_operations() {
        let store = SqliteCoreStore::open(SQLITE_MEMORY).await.unwrap();
        operations(&store).await;
        assert_eq!(store.backend(), "sqlite");
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cores.db");
        let path = path.to_str().unwrap();
        let record = core();

        {
            let store = SqliteCoreStore::open(path).await.unwrap();
            store.upsert(&record).await.unwrap();
        }

        let store = SqliteCoreStore::open(path).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn corrupt_record_is_reported() {
        let store = SqliteCoreStore::open(SQLITE_MEMORY).await.unwrap();
        let id = Uuid::new_v4();
        let key = id.to_string();
        store
            .connection
            .call(move |connection| {
                connection.execute(UPSERT_SQL, rusqlite::params![key, "not json"])?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(store.get(id).await, Err(StoreError::Decode { .. })));
    }
}
