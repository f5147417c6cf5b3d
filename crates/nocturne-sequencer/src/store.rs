// Sequence persistence: a key-value table keyed by UUID, holding the JSON
// document plus bookkeeping columns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use uuid::Uuid;

use nocturne_types::{EngineError, Result};

/// One persisted sequence row.
#[derive(Debug, Clone)]
pub struct SequenceRecord {
    pub uuid: Uuid,
    pub name: String,
    pub data: String,
    pub created_at: String,
}

/// SQLite-backed store for sequences.
pub struct SequenceStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SequenceStore {
    /// Opens (or creates) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| EngineError::Persistence(format!("open {}: {e}", path.display())))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )
        .map_err(|e| EngineError::Persistence(format!("pragma: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sequences (
                uuid        TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                data        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_name ON sequences(name);",
        )
        .map_err(|e| EngineError::Persistence(format!("schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        })
    }

    /// Inserts or replaces a sequence document.
    pub async fn save(&self, uuid: Uuid, name: &str, data: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO sequences (uuid, name, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![uuid.to_string(), name, data, Utc::now().to_rfc3339()],
        )
        .map_err(|e| EngineError::Persistence(format!("save sequence: {e}")))?;
        Ok(())
    }

    pub async fn load(&self, uuid: Uuid) -> Result<SequenceRecord> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT uuid, name, data, created_at FROM sequences WHERE uuid = ?1",
            params![uuid.to_string()],
            |row| {
                Ok(SequenceRecord {
                    uuid: row
                        .get::<_, String>(0)?
                        .parse()
                        .unwrap_or_else(|_| Uuid::nil()),
                    name: row.get(1)?,
                    data: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound(format!("sequence {uuid}"))
            }
            other => EngineError::Persistence(format!("load sequence: {other}")),
        })
    }

    pub async fn list(&self) -> Result<Vec<SequenceRecord>> {
        let conn = self.conn.lock().await;
        let mut statement = conn
            .prepare("SELECT uuid, name, data, created_at FROM sequences ORDER BY created_at")
            .map_err(|e| EngineError::Persistence(format!("list sequences: {e}")))?;
        let rows = statement
            .query_map([], |row| {
                Ok(SequenceRecord {
                    uuid: row
                        .get::<_, String>(0)?
                        .parse()
                        .unwrap_or_else(|_| Uuid::nil()),
                    name: row.get(1)?,
                    data: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(|e| EngineError::Persistence(format!("list sequences: {e}")))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| EngineError::Persistence(format!("row: {e}")))?);
        }
        Ok(records)
    }

    /// Returns true when a row was removed.
    pub async fn delete(&self, uuid: Uuid) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "DELETE FROM sequences WHERE uuid = ?1",
                params![uuid.to_string()],
            )
            .map_err(|e| EngineError::Persistence(format!("delete sequence: {e}")))?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SequenceStore) {
        let dir = TempDir::new().unwrap();
        let store = SequenceStore::open(&dir.path().join("sequences.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let (_dir, store) = store().await;
        let id = Uuid::new_v4();
        store.save(id, "Winter session", "{\"targets\":[]}").await.unwrap();
        let record = store.load(id).await.unwrap();
        assert_eq!(record.uuid, id);
        assert_eq!(record.name, "Winter session");
        assert_eq!(record.data, "{\"targets\":[]}");
        assert!(!record.created_at.is_empty());
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let (_dir, store) = store().await;
        let err = store.load(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (_dir, store) = store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.save(a, "a", "{}").await.unwrap();
        store.save(b, "b", "{}").await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(store.delete(a).await.unwrap());
        assert!(!store.delete(a).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_overwrites_existing() {
        let (_dir, store) = store().await;
        let id = Uuid::new_v4();
        store.save(id, "v1", "{}").await.unwrap();
        store.save(id, "v2", "{\"name\":\"x\"}").await.unwrap();
        let record = store.load(id).await.unwrap();
        assert_eq!(record.name, "v2");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
