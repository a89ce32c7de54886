//! Local sync part: keeps storage up to date with the live documents.
//!
//! Every registered document is loaded from storage once (or given an empty
//! baseline record), then observed. A mutation bumps the document's
//! generation, marks it `saving` and queues it. The main loop writes the diff
//! since the last saved marker inside a per-document transaction and clears
//! `saving` only if no mutation happened meanwhile, so `saving == false`
//! always means "everything in the live document is durable".
//!
//! Local edits additionally bump the document's seq number and are announced
//! as [`DocEvent::ClientUpdateCommitted`]; that is what the remote part
//! pushes on.

use crate::config::EngineConfig;
use crate::doc::{SyncDoc, UpdateOrigin};
use crate::error::Result;
use crate::event::DocEvent;
use crate::queue::AsyncPriorityQueue;
use crate::state::{LocalDocState, LocalStatus};
use crate::storage::DocStorageAdapter;
use crate::{DocId, Error, Priority};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

struct LocalDoc {
    handle: Arc<dyn SyncDoc>,
    loaded: bool,
    /// Marker of the state last written to storage; `None` writes everything
    saved_marker: Option<Vec<u8>>,
    /// Bumped on every observed mutation
    generation: u64,
    /// Local-origin mutations not yet committed
    local_dirty: bool,
    failures: u32,
}

struct LocalInner {
    client_id: String,
    storage: DocStorageAdapter,
    config: EngineConfig,
    docs: DashMap<DocId, LocalDoc>,
    queue: AsyncPriorityQueue,
    status: watch::Sender<LocalStatus>,
}

/// Persists live documents and reports what is not yet saved.
#[derive(Clone)]
pub struct DocEngineLocalPart {
    inner: Arc<LocalInner>,
}

impl DocEngineLocalPart {
    pub fn new(client_id: impl Into<String>, storage: DocStorageAdapter, config: EngineConfig) -> Self {
        let (status, _) = watch::channel(LocalStatus::default());
        Self {
            inner: Arc::new(LocalInner {
                client_id: client_id.into(),
                storage,
                config,
                docs: DashMap::new(),
                queue: AsyncPriorityQueue::new(),
                status,
            }),
        }
    }

    /// Register a document. Registering the same id again is a no-op.
    ///
    /// The document becomes `ready` once the main loop has loaded it.
    pub fn add_doc(&self, doc: Arc<dyn SyncDoc>, priority: Priority) {
        let doc_id = doc.guid().to_string();
        match self.inner.docs.entry(doc_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(LocalDoc {
                    handle: doc.clone(),
                    loaded: false,
                    saved_marker: None,
                    generation: 0,
                    local_dirty: false,
                    failures: 0,
                });
            }
        }

        self.inner.status.send_modify(|status| {
            status.docs.insert(
                doc_id.clone(),
                LocalDocState {
                    priority,
                    ..Default::default()
                },
            );
        });
        self.inner.queue.set_priority(&doc_id, priority);

        let weak: Weak<LocalInner> = Arc::downgrade(&self.inner);
        doc.observe_updates(Arc::new(move |guid, origin| {
            if let Some(inner) = weak.upgrade() {
                inner.on_update(guid, origin);
            }
        }));

        tracing::debug!(doc_id = %doc_id, priority, "local part registered doc");
        self.inner.queue.push(&doc_id);
    }

    pub fn set_priority(&self, doc_id: &str, priority: Priority) {
        self.inner.queue.set_priority(doc_id, priority);
        self.inner.update_doc(doc_id, |doc| doc.priority = priority);
    }

    pub fn has_doc(&self, doc_id: &str) -> bool {
        self.inner.docs.contains_key(doc_id)
    }

    pub fn doc(&self, doc_id: &str) -> Option<Arc<dyn SyncDoc>> {
        self.inner.docs.get(doc_id).map(|doc| doc.handle.clone())
    }

    pub fn doc_ids(&self) -> Vec<DocId> {
        self.inner.docs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Forget committed seq numbers after sync metadata was cleared.
    pub fn reset_commits(&self) {
        self.inner.status.send_modify(|status| {
            for doc in status.docs.values_mut() {
                doc.committed_seq = 0;
            }
        });
    }

    pub fn status(&self) -> watch::Receiver<LocalStatus> {
        self.inner.status.subscribe()
    }

    pub fn snapshot(&self) -> LocalStatus {
        self.inner.status.borrow().clone()
    }

    /// Load and persist documents until `cancel` fires.
    ///
    /// Always returns `Err(Error::Cancelled)`; failures of individual
    /// documents are retried and reported through the status.
    pub async fn main_loop(&self, cancel: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let mut events = Some(inner.storage.event_bus().subscribe());
        inner.enqueue_outstanding();
        tracing::debug!(client_id = %inner.client_id, "local sync loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("local sync loop stopped");
                    return Err(Error::Cancelled);
                }
                event = next_event(&mut events) => {
                    inner.handle_event(event, &mut events).await;
                }
                doc_id = inner.queue.next() => {
                    inner.run_job(&doc_id, &cancel).await;
                }
            }
        }
    }
}

/// Receive the next bus event, or wait forever once the bus is gone.
async fn next_event(
    events: &mut Option<broadcast::Receiver<DocEvent>>,
) -> std::result::Result<DocEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl LocalInner {
    fn update_doc(&self, doc_id: &str, f: impl FnOnce(&mut LocalDocState)) {
        self.status.send_if_modified(|status| match status.docs.get_mut(doc_id) {
            Some(doc) => {
                let before = doc.clone();
                f(doc);
                *doc != before
            }
            None => false,
        });
    }

    /// Observer callback. Runs synchronously inside the mutating call.
    fn on_update(&self, doc_id: &str, origin: UpdateOrigin) {
        if origin == UpdateOrigin::Storage {
            return;
        }
        {
            let Some(mut doc) = self.docs.get_mut(doc_id) else {
                return;
            };
            doc.generation += 1;
            if origin == UpdateOrigin::Local {
                doc.local_dirty = true;
            }
        }
        self.update_doc(doc_id, |doc| doc.saving = true);
        self.queue.push(doc_id);
    }

    /// Queue every document with unfinished work.
    fn enqueue_outstanding(&self) {
        let status = self.status.borrow().clone();
        for entry in self.docs.iter() {
            let pending = status
                .docs
                .get(entry.key())
                .map(|doc| doc.saving)
                .unwrap_or(false);
            if !entry.loaded || pending {
                self.queue.push(entry.key());
            }
        }
    }

    async fn run_job(self: &Arc<Self>, doc_id: &str, cancel: &CancellationToken) {
        let loaded = match self.docs.get(doc_id) {
            Some(doc) => doc.loaded,
            None => return,
        };

        let result = if loaded {
            self.save(doc_id).await
        } else {
            self.load(doc_id).await
        };

        match result {
            Ok(()) => {
                if let Some(mut doc) = self.docs.get_mut(doc_id) {
                    doc.failures = 0;
                }
                self.update_doc(doc_id, |doc| doc.error_message = None);
            }
            Err(err) => self.on_failure(doc_id, err, cancel),
        }
    }

    #[tracing::instrument(skip(self), fields(client_id = %self.client_id))]
    async fn load(&self, doc_id: &str) -> Result<()> {
        let Some(handle) = self.docs.get(doc_id).map(|doc| doc.handle.clone()) else {
            return Ok(());
        };

        let tx = self.storage.transaction(doc_id).await;
        let committed_seq = tx.seq_num().await?;
        let saved_marker = match tx.get_doc_update().await? {
            Some(stored) => {
                let before = handle.state_marker();
                let generation = self.generation(doc_id);
                handle.apply_update(&stored, UpdateOrigin::Storage)?;
                tracing::debug!(doc_id, bytes = stored.len(), "loaded doc from storage");
                // edits made before this point are not in storage yet
                (generation == 0).then_some(before)
            }
            None => {
                let baseline = handle.encode_diff(None)?;
                tx.set_doc_update(baseline.update).await?;
                tracing::debug!(doc_id, "wrote baseline for new doc");
                Some(baseline.marker)
            }
        };
        drop(tx);

        let edited = match self.docs.get_mut(doc_id) {
            Some(mut doc) => {
                doc.loaded = true;
                doc.saved_marker = saved_marker;
                doc.generation != 0
            }
            None => false,
        };
        self.update_doc(doc_id, |doc| {
            doc.ready = true;
            doc.committed_seq = committed_seq;
        });
        // mutations seen before the load only found the load job queued
        if edited {
            self.queue.push(doc_id);
        }
        Ok(())
    }

    fn generation(&self, doc_id: &str) -> u64 {
        self.docs.get(doc_id).map(|doc| doc.generation).unwrap_or(0)
    }

    async fn save(&self, doc_id: &str) -> Result<()> {
        let tx = self.storage.transaction(doc_id).await;

        let (handle, saved_marker, generation, dirty) = {
            let Some(mut doc) = self.docs.get_mut(doc_id) else {
                return Ok(());
            };
            let dirty = std::mem::take(&mut doc.local_dirty);
            (doc.handle.clone(), doc.saved_marker.clone(), doc.generation, dirty)
        };

        let result = self.commit(&tx, &handle, saved_marker.as_deref(), dirty).await;
        let (marker, committed_seq) = match result {
            Ok(committed) => committed,
            Err(err) => {
                if dirty {
                    if let Some(mut doc) = self.docs.get_mut(doc_id) {
                        doc.local_dirty = true;
                    }
                }
                return Err(err);
            }
        };
        drop(tx);

        let settled = match self.docs.get_mut(doc_id) {
            Some(mut doc) => {
                doc.saved_marker = Some(marker);
                doc.generation == generation
            }
            None => false,
        };
        self.update_doc(doc_id, |doc| {
            if let Some(seq) = committed_seq {
                doc.committed_seq = seq;
            }
            if settled {
                doc.saving = false;
            }
        });
        Ok(())
    }

    /// Write the diff since `saved_marker`, returning the new saved marker and
    /// the seq number of a local commit.
    async fn commit(
        &self,
        tx: &crate::storage::DocTransaction,
        handle: &Arc<dyn SyncDoc>,
        saved_marker: Option<&[u8]>,
        dirty: bool,
    ) -> Result<(Vec<u8>, Option<u64>)> {
        let doc_id = tx.doc_id().to_string();
        let diff = handle.encode_diff(saved_marker)?;

        if !diff.is_empty {
            let merged = match tx.get_doc_update().await? {
                Some(existing) => handle.merge_updates(&[&existing, &diff.update])?,
                None => diff.update.clone(),
            };
            tx.set_doc_update(merged).await?;
        }

        let bus = self.storage.event_bus();
        let mut committed_seq = None;
        if dirty {
            let seq_num = tx.seq_num().await? + 1;
            tx.set_seq_num(seq_num).await?;
            tracing::debug!(doc_id = %doc_id, seq_num, bytes = diff.update.len(), "committed local update");
            bus.emit(DocEvent::ClientUpdateCommitted {
                client_id: self.client_id.clone(),
                doc_id,
                update: diff.update,
                seq_num,
            });
            committed_seq = Some(seq_num);
        } else if !diff.is_empty {
            tracing::debug!(doc_id = %doc_id, bytes = diff.update.len(), "committed server update");
            bus.emit(DocEvent::ServerUpdateCommitted {
                client_id: self.client_id.clone(),
                doc_id,
                update: diff.update,
            });
        }
        Ok((diff.marker, committed_seq))
    }

    fn on_failure(self: &Arc<Self>, doc_id: &str, err: Error, cancel: &CancellationToken) {
        let failures = match self.docs.get_mut(doc_id) {
            Some(mut doc) => {
                doc.failures += 1;
                doc.failures
            }
            None => return,
        };

        let delay = self.config.backoff.delay(failures);
        tracing::warn!(doc_id, attempt = failures, ?delay, error = %err, "local write failed, retrying");
        if failures >= self.config.local_error_threshold {
            tracing::error!(doc_id, attempt = failures, error = %err, "local writes keep failing");
            let message = err.to_string();
            self.update_doc(doc_id, |doc| doc.error_message = Some(message));
        }

        let cancel = cancel.clone();
        let doc_id = doc_id.to_string();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.queue.push(&doc_id);
                    }
                }
            }
        });
    }

    /// Apply updates other clients committed to the shared storage.
    async fn handle_event(
        &self,
        event: std::result::Result<DocEvent, broadcast::error::RecvError>,
        events: &mut Option<broadcast::Receiver<DocEvent>>,
    ) {
        match event {
            Ok(event) => {
                if event.client_id() == self.client_id || event.update().is_empty() {
                    return;
                }
                let Some(handle) = self.loaded_handle(event.doc_id()) else {
                    return;
                };
                if let Err(err) = handle.apply_update(event.update(), UpdateOrigin::Storage) {
                    tracing::warn!(doc_id = %event.doc_id(), error = %err, "failed to apply committed update");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "missed storage events, reloading docs");
                self.reload_all().await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                *events = None;
            }
        }
    }

    fn loaded_handle(&self, doc_id: &str) -> Option<Arc<dyn SyncDoc>> {
        self.docs
            .get(doc_id)
            .filter(|doc| doc.loaded)
            .map(|doc| doc.handle.clone())
    }

    async fn reload_all(&self) {
        let doc_ids: Vec<DocId> = self.docs.iter().map(|entry| entry.key().clone()).collect();
        for doc_id in doc_ids {
            let Some(handle) = self.loaded_handle(&doc_id) else {
                continue;
            };
            let stored = match self.storage.get_doc_update(&doc_id).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(doc_id = %doc_id, error = %err, "reload failed");
                    continue;
                }
            };
            if let Err(err) = handle.apply_update(&stored, UpdateOrigin::Storage) {
                tracing::warn!(doc_id = %doc_id, error = %err, "reload failed");
            }
        }
    }
}
