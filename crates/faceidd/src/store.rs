//! Persistent identity gallery backed by SQLite.
//!
//! The store is the system of record: `identity_id → embedding`. The in-memory
//! gallery cache is rebuilt from here and never written to. All access goes
//! through the connection's background thread, which serializes writers while
//! readers queue behind them.

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use faceid_core::Embedding;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of an upsert: whether the identity already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Durable key→value gallery of registered identities.
#[async_trait]
pub trait GalleryStore: Send + Sync + 'static {
    /// Every record in the store's natural read order:
    /// `(identity_id, raw embedding bytes)`.
    async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Insert or overwrite the embedding for an identity (last-write-wins).
    async fn upsert(&self, identity_id: &str, embedding: &Embedding) -> Result<Upsert, StoreError>;

    /// Remove an identity. Returns whether a record existed.
    async fn delete(&self, identity_id: &str) -> Result<bool, StoreError>;

    /// All registered identity ids in natural read order.
    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS identities (
    identity_id TEXT PRIMARY KEY,
    embedding   BLOB NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
)";

/// SQLite-backed [`GalleryStore`].
pub struct SqliteGalleryStore {
    conn: Connection,
}

impl SqliteGalleryStore {
    /// Open (creating if needed) the gallery database at the given path.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.init_schema().await?;

        tracing::info!(path = %db_path.display(), "gallery database opened");
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute(CREATE_TABLE, [])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GalleryStore for SqliteGalleryStore {
    async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT identity_id, embedding FROM identities ORDER BY rowid")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    async fn upsert(&self, identity_id: &str, embedding: &Embedding) -> Result<Upsert, StoreError> {
        let id = identity_id.to_string();
        let blob = embedding.to_le_bytes();
        let now = Utc::now().to_rfc3339();

        let outcome = self
            .conn
            .call(move |conn| {
                let existed: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM identities WHERE identity_id = ?1)",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO identities (identity_id, embedding, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(identity_id) DO UPDATE SET
                         embedding = excluded.embedding,
                         updated_at = excluded.updated_at",
                    rusqlite::params![id, blob, now],
                )?;
                Ok(if existed { Upsert::Updated } else { Upsert::Inserted })
            })
            .await?;

        tracing::debug!(identity = identity_id, ?outcome, "gallery upsert");
        Ok(outcome)
    }

    async fn delete(&self, identity_id: &str) -> Result<bool, StoreError> {
        let id = identity_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let affected =
                    conn.execute("DELETE FROM identities WHERE identity_id = ?1", rusqlite::params![id])?;
                Ok(affected > 0)
            })
            .await?;

        tracing::debug!(identity = identity_id, removed, "gallery delete");
        Ok(removed)
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT identity_id FROM identities ORDER BY rowid")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[tokio::test]
    async fn test_upsert_and_get_all_roundtrip() {
        let store = SqliteGalleryStore::open_in_memory().await.unwrap();

        let outcome = store.upsert("alice", &embedding(&[1.0, 2.0])).await.unwrap();
        assert_eq!(outcome, Upsert::Inserted);

        let rows = store.get_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "alice");
        let decoded = Embedding::from_le_bytes(&rows[0].1).unwrap();
        assert_eq!(decoded.values, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_identity() {
        let store = SqliteGalleryStore::open_in_memory().await.unwrap();

        store.upsert("alice", &embedding(&[1.0, 0.0])).await.unwrap();
        let outcome = store.upsert("alice", &embedding(&[0.0, 1.0])).await.unwrap();
        assert_eq!(outcome, Upsert::Updated);

        // Exactly one record, holding the last write.
        let rows = store.get_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        let decoded = Embedding::from_le_bytes(&rows[0].1).unwrap();
        assert_eq!(decoded.values, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_natural_read_order_is_insertion_order() {
        let store = SqliteGalleryStore::open_in_memory().await.unwrap();

        store.upsert("carol", &embedding(&[1.0])).await.unwrap();
        store.upsert("alice", &embedding(&[2.0])).await.unwrap();
        store.upsert("bob", &embedding(&[3.0])).await.unwrap();

        let ids = store.list_ids().await.unwrap();
        assert_eq!(ids, vec!["carol", "alice", "bob"]);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = SqliteGalleryStore::open_in_memory().await.unwrap();

        store.upsert("alice", &embedding(&[1.0])).await.unwrap();
        assert!(store.delete("alice").await.unwrap());
        assert!(!store.delete("alice").await.unwrap());
        assert!(store.get_all().await.unwrap().is_empty());
    }
}
