//! In-memory storage backend.

use super::{ByteKv, DocLocks, DocStorage};
use crate::error::Result;
use crate::event::{DocEventBus, MemoryDocEventBus};
use crate::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared switches and counters of a [`MemoryDocStorage`].
#[derive(Debug, Default)]
struct Probe {
    operations: AtomicU64,
    unavailable: AtomicBool,
    failing_writes: AtomicU32,
    latency_ms: AtomicU64,
}

impl Probe {
    async fn enter(&self, write: bool) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("storage offline".into()));
        }
        if write
            && self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::StorageUnavailable("injected write failure".into()));
        }
        Ok(())
    }
}

struct MemoryKv {
    entries: DashMap<String, Vec<u8>>,
    probe: Arc<Probe>,
}

impl MemoryKv {
    fn new(probe: Arc<Probe>) -> Self {
        Self {
            entries: DashMap::new(),
            probe,
        }
    }
}

#[async_trait]
impl ByteKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.probe.enter(false).await?;
        Ok(self.entries.get(key).map(|value| value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.probe.enter(true).await?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.probe.enter(true).await?;
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.probe.enter(false).await?;
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        self.probe.enter(true).await?;
        self.entries.clear();
        Ok(())
    }
}

/// Volatile [`DocStorage`], shared by cloning the `Arc` it lives in.
///
/// Beyond plain storage it counts every operation and can simulate an
/// unavailable or slow disk.
pub struct MemoryDocStorage {
    doc: MemoryKv,
    sync_metadata: MemoryKv,
    server_clock: MemoryKv,
    bus: Arc<MemoryDocEventBus>,
    locks: DocLocks,
    probe: Arc<Probe>,
}

impl Default for MemoryDocStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocStorage {
    pub fn new() -> Self {
        let probe = Arc::new(Probe::default());
        Self {
            doc: MemoryKv::new(probe.clone()),
            sync_metadata: MemoryKv::new(probe.clone()),
            server_clock: MemoryKv::new(probe.clone()),
            bus: Arc::new(MemoryDocEventBus::new()),
            locks: DocLocks::new(),
            probe,
        }
    }

    /// Total number of key-value operations served (including failed ones).
    pub fn operation_count(&self) -> u64 {
        self.probe.operations.load(Ordering::SeqCst)
    }

    /// Fail every operation while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.probe.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.probe.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        let ms = latency.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.probe.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Stored document bytes, bypassing counters and failure injection.
    pub fn raw_doc(&self, doc_id: &str) -> Option<Vec<u8>> {
        self.doc.entries.get(doc_id).map(|value| value.clone())
    }

    /// Stored sync metadata keys, bypassing counters and failure injection.
    pub fn raw_sync_metadata_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .sync_metadata
            .entries
            .iter()
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of stored server clocks, bypassing counters and failure injection.
    pub fn raw_server_clock_count(&self) -> usize {
        self.server_clock.entries.len()
    }
}

impl DocStorage for MemoryDocStorage {
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

    #[tokio::test]
    async fn counts_operations() {
        let storage = MemoryDocStorage::new();
        storage.doc().set("a", vec![1]).await.unwrap();
        storage.doc().get("a").await.unwrap();
        storage.sync_metadata().keys().await.unwrap();
        assert_eq!(storage.operation_count(), 3);
    }

    #[tokio::test]
    async fn fail_next_writes_only_affects_writes() {
        let storage = MemoryDocStorage::new();
        storage.fail_next_writes(2);

        assert!(storage.doc().get("a").await.is_ok());
        assert!(storage.doc().set("a", vec![1]).await.is_err());
        assert!(storage.doc().set("a", vec![1]).await.is_err());
        assert!(storage.doc().set("a", vec![1]).await.is_ok());
        assert_eq!(storage.raw_doc("a"), Some(vec![1]));
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let storage = MemoryDocStorage::new();
        storage.doc().set("k", vec![1]).await.unwrap();
        storage.sync_metadata().set("k", vec![2]).await.unwrap();
        storage.server_clock().set("k", vec![3]).await.unwrap();

        storage.sync_metadata().clear().await.unwrap();
        assert_eq!(storage.doc().get("k").await.unwrap(), Some(vec![1]));
        assert_eq!(storage.sync_metadata().get("k").await.unwrap(), None);
        assert_eq!(storage.raw_server_clock_count(), 1);
    }
}
