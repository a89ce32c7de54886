//! SQLite storage backend.
//!
//! One database can hold many document collections: every table is keyed by
//! `(workspace_id, key)`.

use super::{ByteKv, DocLocks, DocStorage};
use crate::error::Result;
use crate::event::{DocEventBus, MemoryDocEventBus};
use crate::Error;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;

const TABLES: [&str; 3] = ["docs", "sync_metadata", "server_clock"];

fn storage_err(err: sqlx::Error) -> Error {
    Error::StorageUnavailable(err.to_string())
}

struct SqliteKv {
    pool: SqlitePool,
    workspace_id: String,
    table: &'static str,
}

#[async_trait]
impl ByteKv for SqliteKv {
    #[tracing::instrument(skip(self), fields(table = self.table))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let sql = format!(
            "SELECT value FROM {} WHERE workspace_id = ? AND key = ?",
            self.table
        );
        sqlx::query_scalar::<_, Vec<u8>>(&sql)
            .bind(&self.workspace_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)
    }

    #[tracing::instrument(skip(self, value), fields(table = self.table, len = value.len()))]
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (workspace_id, key, value, updated_at) \
             VALUES (?, ?, ?, strftime('%s', 'now')) \
             ON CONFLICT (workspace_id, key) DO UPDATE \
             SET value = excluded.value, updated_at = excluded.updated_at",
            self.table
        );
        sqlx::query(&sql)
            .bind(&self.workspace_id)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE workspace_id = ? AND key = ?", self.table);
        sqlx::query(&sql)
            .bind(&self.workspace_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT key FROM {} WHERE workspace_id = ? ORDER BY key",
            self.table
        );
        sqlx::query_scalar::<_, String>(&sql)
            .bind(&self.workspace_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)
    }

    async fn clear(&self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE workspace_id = ?", self.table);
        sqlx::query(&sql)
            .bind(&self.workspace_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

/// [`DocStorage`] persisted in SQLite.
pub struct SqliteDocStorage {
    doc: SqliteKv,
    sync_metadata: SqliteKv,
    server_clock: SqliteKv,
    bus: Arc<MemoryDocEventBus>,
    locks: DocLocks,
}

impl SqliteDocStorage {
    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str, workspace_id: &str) -> Result<Self> {
        // every in-memory connection is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(storage_err)?;
        Self::from_pool(pool, workspace_id).await
    }

    /// Use an existing pool. Creates the tables when missing.
    pub async fn from_pool(pool: SqlitePool, workspace_id: &str) -> Result<Self> {
        for table in TABLES {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 workspace_id TEXT NOT NULL, \
                 key TEXT NOT NULL, \
                 value BLOB NOT NULL, \
                 updated_at INTEGER NOT NULL DEFAULT 0, \
                 PRIMARY KEY (workspace_id, key))"
            );
            sqlx::query(&sql).execute(&pool).await.map_err(storage_err)?;
        }
        tracing::debug!(workspace_id, "sqlite storage ready");

        let kv = |table: &'static str| SqliteKv {
            pool: pool.clone(),
            workspace_id: workspace_id.to_string(),
            table,
        };
        Ok(Self {
            doc: kv(TABLES[0]),
            sync_metadata: kv(TABLES[1]),
            server_clock: kv(TABLES[2]),
            bus: Arc::new(MemoryDocEventBus::new()),
            locks: DocLocks::new(),
        })
    }

    pub fn workspace_id(&self) -> &str {
        &self.doc.workspace_id
    }
}

impl DocStorage for SqliteDocStorage {
    fn doc(&self) -> &dyn ByteKv {
        &self.doc
    }

    fn sync_metadata(&self) -> &dyn ByteKv {
        &self.sync_metadata
    }

    fn server_clock(&self) -> &dyn ByteKv {
        &self.server_clock
    }

    fn event_bus(&self) -> Arc<dyn DocEventBus> {
        self.bus.clone()
    }

    fn locks(&self) -> &DocLocks {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(pool: &SqlitePool, workspace: &str) -> SqliteDocStorage {
        SqliteDocStorage::from_pool(pool.clone(), workspace).await.unwrap()
    }

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn set_get_overwrite() {
        let pool = memory_pool().await;
        let storage = open(&pool, "ws-1").await;

        storage.doc().set("doc-1", vec![1]).await.unwrap();
        storage.doc().set("doc-1", vec![2, 3]).await.unwrap();
        assert_eq!(storage.doc().get("doc-1").await.unwrap(), Some(vec![2, 3]));
        assert_eq!(storage.doc().get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn workspaces_are_isolated() {
        let pool = memory_pool().await;
        let first = open(&pool, "ws-1").await;
        let second = open(&pool, "ws-2").await;

        first.sync_metadata().set("doc-1:seq", vec![1]).await.unwrap();
        second.sync_metadata().set("doc-2:seq", vec![2]).await.unwrap();

        assert_eq!(first.sync_metadata().keys().await.unwrap(), vec!["doc-1:seq"]);
        first.sync_metadata().clear().await.unwrap();
        assert!(first.sync_metadata().keys().await.unwrap().is_empty());
        assert_eq!(second.sync_metadata().keys().await.unwrap(), vec!["doc-2:seq"]);
    }

    #[tokio::test]
    async fn reopen_keeps_data() {
        let pool = memory_pool().await;
        open(&pool, "ws-1")
            .await
            .server_clock()
            .set("doc-1", vec![0, 0, 0, 0, 0, 0, 0, 9])
            .await
            .unwrap();

        let reopened = open(&pool, "ws-1").await;
        assert_eq!(
            reopened.server_clock().get("doc-1").await.unwrap(),
            Some(vec![0, 0, 0, 0, 0, 0, 0, 9])
        );
        reopened.server_clock().del("doc-1").await.unwrap();
        assert_eq!(reopened.server_clock().get("doc-1").await.unwrap(), None);
    }
}
