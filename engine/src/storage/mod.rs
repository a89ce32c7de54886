//! Durable storage for document state and sync bookkeeping.
//!
//! A [`DocStorage`] backend exposes three byte key-value namespaces:
//!
//! - `doc`: merged document state, keyed by document id
//! - `sync_metadata`: resume bookkeeping (seq numbers, push marker, clocks)
//! - `server_clock`: the newest server clock known per document
//!
//! [`DocStorageAdapter`] is what the engine talks to. It adds storage
//! timeouts, typed metadata accessors and per-document transactions on top
//! of a backend.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryDocStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDocStorage;

use crate::clock::ServerClock;
use crate::error::Result;
use crate::event::DocEventBus;
use crate::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Sync metadata key holding the newest clock seen for the whole collection.
pub const WORKSPACE_CLOCK_KEY: &str = "@workspace:clock";

/// A namespace of binary values.
#[async_trait]
pub trait ByteKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn clear(&self) -> Result<()>;
}

/// Storage backend for one document collection.
pub trait DocStorage: Send + Sync {
    fn doc(&self) -> &dyn ByteKv;
    fn sync_metadata(&self) -> &dyn ByteKv;
    fn server_clock(&self) -> &dyn ByteKv;

    /// Bus on which writers to this storage announce their commits.
    fn event_bus(&self) -> Arc<dyn DocEventBus>;

    /// Lock table serializing read-modify-write sequences per document.
    /// Shared by every adapter opened over this storage.
    fn locks(&self) -> &DocLocks;
}

/// Per-document async locks.
#[derive(Debug, Default)]
pub struct DocLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DocLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `doc_id`.
    pub async fn lock(&self, doc_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(doc_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }
}

/// Engine-facing wrapper around a [`DocStorage`] backend.
#[derive(Clone)]
pub struct DocStorageAdapter {
    storage: Arc<dyn DocStorage>,
    timeout: Duration,
}

impl std::fmt::Debug for DocStorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStorageAdapter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DocStorageAdapter {
    pub fn new(storage: Arc<dyn DocStorage>, timeout: Duration) -> Self {
        Self { storage, timeout }
    }

    pub fn event_bus(&self) -> Arc<dyn DocEventBus> {
        self.storage.event_bus()
    }

    /// Open a transaction on one document.
    ///
    /// Holds the document's lock until dropped. Other transactions on the
    /// same document (from any adapter over the same storage) wait.
    pub async fn transaction(&self, doc_id: &str) -> DocTransaction {
        let guard = self.storage.locks().lock(doc_id).await;
        DocTransaction {
            adapter: self.clone(),
            doc_id: doc_id.to_string(),
            _guard: guard,
        }
    }

    async fn timed<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::StorageUnavailable(format!(
                "{op} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    // Document state

    pub async fn get_doc_update(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        self.timed("get doc", self.storage.doc().get(doc_id)).await
    }

    pub async fn set_doc_update(&self, doc_id: &str, update: Vec<u8>) -> Result<()> {
        self.timed("set doc", self.storage.doc().set(doc_id, update)).await
    }

    pub async fn list_doc_ids(&self) -> Result<Vec<String>> {
        self.timed("list docs", self.storage.doc().keys()).await
    }

    // Raw sync metadata

    pub async fn get_sync_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.timed("get sync metadata", self.storage.sync_metadata().get(key))
            .await
    }

    pub async fn set_sync_metadata(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.timed("set sync metadata", self.storage.sync_metadata().set(key, value))
            .await
    }

    pub async fn del_sync_metadata(&self, key: &str) -> Result<()> {
        self.timed("del sync metadata", self.storage.sync_metadata().del(key))
            .await
    }

    pub async fn list_sync_metadata_keys(&self) -> Result<Vec<String>> {
        self.timed("list sync metadata", self.storage.sync_metadata().keys())
            .await
    }

    pub async fn clear_sync_metadata(&self) -> Result<()> {
        self.timed("clear sync metadata", self.storage.sync_metadata().clear())
            .await
    }

    // Server clocks

    pub async fn get_server_clock(&self, doc_id: &str) -> Result<Option<ServerClock>> {
        let raw = self
            .timed("get server clock", self.storage.server_clock().get(doc_id))
            .await?;
        raw.map(|bytes| ServerClock::from_bytes(&bytes)).transpose()
    }

    /// Store `clock` unless a newer one is already recorded.
    ///
    /// Runs inside the document's transaction.
    pub async fn set_server_clock(&self, doc_id: &str, clock: ServerClock) -> Result<()> {
        let _tx = self.transaction(doc_id).await;
        if let Some(current) = self.get_server_clock(doc_id).await? {
            if current >= clock {
                return Ok(());
            }
        }
        self.timed(
            "set server clock",
            self.storage.server_clock().set(doc_id, clock.to_bytes()),
        )
        .await
    }

    pub async fn del_server_clock(&self, doc_id: &str) -> Result<()> {
        self.timed("del server clock", self.storage.server_clock().del(doc_id))
            .await
    }

    pub async fn list_server_clock_keys(&self) -> Result<Vec<String>> {
        self.timed("list server clocks", self.storage.server_clock().keys())
            .await
    }

    pub async fn clear_server_clocks(&self) -> Result<()> {
        self.timed("clear server clocks", self.storage.server_clock().clear())
            .await
    }

    // Typed sync metadata

    pub async fn seq_num(&self, doc_id: &str) -> Result<u64> {
        self.get_u64(&seq_key(doc_id)).await
    }

    pub async fn set_seq_num(&self, doc_id: &str, seq: u64) -> Result<()> {
        self.set_sync_metadata(&seq_key(doc_id), seq.to_be_bytes().to_vec())
            .await
    }

    /// Local seq number covered by the last successful push.
    pub async fn pushed_seq_num(&self, doc_id: &str) -> Result<u64> {
        self.get_u64(&pushed_seq_key(doc_id)).await
    }

    pub async fn set_pushed_seq_num(&self, doc_id: &str, seq: u64) -> Result<()> {
        self.set_sync_metadata(&pushed_seq_key(doc_id), seq.to_be_bytes().to_vec())
            .await
    }

    /// Document state marker covered by the last successful push.
    pub async fn push_marker(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        self.get_sync_metadata(&push_marker_key(doc_id)).await
    }

    pub async fn set_push_marker(&self, doc_id: &str, marker: Vec<u8>) -> Result<()> {
        self.set_sync_metadata(&push_marker_key(doc_id), marker).await
    }

    /// Pull cursor.
    pub async fn pulled_clock(&self, doc_id: &str) -> Result<Option<ServerClock>> {
        self.get_clock(&pulled_clock_key(doc_id)).await
    }

    pub async fn set_pulled_clock(&self, doc_id: &str, clock: ServerClock) -> Result<()> {
        self.set_sync_metadata(&pulled_clock_key(doc_id), clock.to_bytes())
            .await
    }

    pub async fn pushed_clock(&self, doc_id: &str) -> Result<Option<ServerClock>> {
        self.get_clock(&pushed_clock_key(doc_id)).await
    }

    pub async fn set_pushed_clock(&self, doc_id: &str, clock: ServerClock) -> Result<()> {
        self.set_sync_metadata(&pushed_clock_key(doc_id), clock.to_bytes())
            .await
    }

    /// Newest clock seen for any document of the collection.
    pub async fn workspace_clock(&self) -> Result<Option<ServerClock>> {
        self.get_clock(WORKSPACE_CLOCK_KEY).await
    }

    pub async fn set_workspace_clock(&self, clock: ServerClock) -> Result<()> {
        let _guard = self.storage.locks().lock(WORKSPACE_CLOCK_KEY).await;
        if let Some(current) = self.workspace_clock().await? {
            if current >= clock {
                return Ok(());
            }
        }
        self.set_sync_metadata(WORKSPACE_CLOCK_KEY, clock.to_bytes())
            .await
    }

    async fn get_u64(&self, key: &str) -> Result<u64> {
        Ok(self
            .get_clock(key)
            .await?
            .map(|clock| clock.value())
            .unwrap_or(0))
    }

    async fn get_clock(&self, key: &str) -> Result<Option<ServerClock>> {
        self.get_sync_metadata(key)
            .await?
            .map(|bytes| ServerClock::from_bytes(&bytes))
            .transpose()
    }
}

fn seq_key(doc_id: &str) -> String {
    format!("{doc_id}:seq")
}

fn pushed_seq_key(doc_id: &str) -> String {
    format!("{doc_id}:pushed-seq")
}

fn push_marker_key(doc_id: &str) -> String {
    format!("{doc_id}:push-marker")
}

fn pulled_clock_key(doc_id: &str) -> String {
    format!("{doc_id}:pulled-clock")
}

fn pushed_clock_key(doc_id: &str) -> String {
    format!("{doc_id}:pushed-clock")
}

/// Exclusive access to one document's stored state and seq number.
pub struct DocTransaction {
    adapter: DocStorageAdapter,
    doc_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl DocTransaction {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub async fn get_doc_update(&self) -> Result<Option<Vec<u8>>> {
        self.adapter.get_doc_update(&self.doc_id).await
    }

    pub async fn set_doc_update(&self, update: Vec<u8>) -> Result<()> {
        self.adapter.set_doc_update(&self.doc_id, update).await
    }

    pub async fn seq_num(&self) -> Result<u64> {
        self.adapter.seq_num(&self.doc_id).await
    }

    pub async fn set_seq_num(&self, seq: u64) -> Result<()> {
        self.adapter.set_seq_num(&self.doc_id, seq).await
    }
}
