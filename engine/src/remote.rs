//! Remote sync part: exchanges document updates with a [`DocServer`].
//!
//! The main loop runs sessions. A session waits for the server, then
//! "connects" every registered document (pull, then push) and keeps
//! reacting to local commits (push), server notifications (apply and pull)
//! and optional clock polling until the connection is lost, after which a
//! new session starts with backoff.
//!
//! Documents are scheduled through a priority queue drained by at most
//! `concurrency` workers. A document is never pushed and pulled at the same
//! time: work arriving while it is in flight sets a rerun flag instead.

use crate::clock::ServerClock;
use crate::config::EngineConfig;
use crate::doc::{SyncDoc, UpdateOrigin};
use crate::error::Result;
use crate::event::DocEvent;
use crate::queue::AsyncPriorityQueue;
use crate::server::{DocServer, ServerUpdate};
use crate::state::{LocalStatus, RemoteDocState, RemoteStatus};
use crate::storage::DocStorageAdapter;
use crate::{DocId, Error, Priority};
use dashmap::DashMap;
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct RemoteDoc {
    handle: Arc<dyn SyncDoc>,
    needs_pull: bool,
    needs_push: bool,
    /// Pulled at least once in the current session
    connected: bool,
    in_flight: bool,
    rerun: bool,
    /// Consecutive transient failures
    attempts: u32,
    /// Consecutive server rejections
    rejections: u32,
    /// Gave up after too many rejections; waits for new input
    parked: bool,
}

impl RemoteDoc {
    fn new(handle: Arc<dyn SyncDoc>) -> Self {
        Self {
            handle,
            needs_pull: true,
            needs_push: true,
            connected: false,
            in_flight: false,
            rerun: false,
            attempts: 0,
            rejections: 0,
            parked: false,
        }
    }

    fn has_work(&self) -> bool {
        self.needs_pull || self.needs_push || !self.connected
    }
}

struct RemoteInner {
    client_id: String,
    storage: DocStorageAdapter,
    server: Arc<dyn DocServer>,
    config: EngineConfig,
    docs: DashMap<DocId, RemoteDoc>,
    queue: AsyncPriorityQueue,
    status: watch::Sender<RemoteStatus>,
    local_status: watch::Receiver<LocalStatus>,
    /// The server reported changed clocks for this session
    clocks_known: AtomicBool,
    /// Storage writes that outlive a cancelled worker
    writes: TaskTracker,
}

/// Pushes and pulls documents and reports what is not yet synced.
#[derive(Clone)]
pub struct DocEngineRemotePart {
    inner: Arc<RemoteInner>,
}

impl DocEngineRemotePart {
    /// `local_status` is the local part's status; documents are only synced
    /// once loaded, and pulled clocks only advance once pulled updates are
    /// durable.
    pub fn new(
        client_id: impl Into<String>,
        storage: DocStorageAdapter,
        server: Arc<dyn DocServer>,
        config: EngineConfig,
        local_status: watch::Receiver<LocalStatus>,
    ) -> Self {
        let (status, _) = watch::channel(RemoteStatus::default());
        Self {
            inner: Arc::new(RemoteInner {
                client_id: client_id.into(),
                storage,
                server,
                config,
                docs: DashMap::new(),
                queue: AsyncPriorityQueue::new(),
                status,
                local_status,
                clocks_known: AtomicBool::new(false),
                writes: TaskTracker::new(),
            }),
        }
    }

    /// Register a document. Registering the same id again is a no-op.
    pub fn add_doc(&self, doc: Arc<dyn SyncDoc>, priority: Priority) {
        let doc_id = doc.guid().to_string();
        if self.inner.docs.contains_key(&doc_id) {
            return;
        }
        self.inner.docs.insert(doc_id.clone(), RemoteDoc::new(doc));
        self.inner.status.send_modify(|status| {
            status.docs.insert(
                doc_id.clone(),
                RemoteDocState {
                    syncing: true,
                    priority,
                    ..Default::default()
                },
            );
        });
        self.inner.queue.set_priority(&doc_id, priority);
        self.inner.queue.push(&doc_id);
        tracing::debug!(doc_id = %doc_id, priority, "remote part registered doc");
    }

    pub fn set_priority(&self, doc_id: &str, priority: Priority) {
        self.inner.queue.set_priority(doc_id, priority);
        self.inner.update_doc(doc_id, |doc| doc.priority = priority);
    }

    pub fn has_doc(&self, doc_id: &str) -> bool {
        self.inner.docs.contains_key(doc_id)
    }

    pub fn status(&self) -> watch::Receiver<RemoteStatus> {
        self.inner.status.subscribe()
    }

    pub fn snapshot(&self) -> RemoteStatus {
        self.inner.status.borrow().clone()
    }

    /// Forget all in-memory sync progress. Used after sync metadata was
    /// cleared; call while stopped.
    pub fn reset(&self) {
        for mut doc in self.inner.docs.iter_mut() {
            let handle = doc.handle.clone();
            *doc = RemoteDoc::new(handle);
        }
        self.inner.queue.clear();
        self.inner.status.send_modify(|status| {
            status.loop_error = None;
            status.loop_retrying = false;
            for doc in status.docs.values_mut() {
                doc.syncing = true;
                doc.retrying = false;
                doc.error_message = None;
                doc.server_clock = None;
                doc.pushed_seq = 0;
            }
        });
    }

    /// Run sessions until `cancel` fires.
    ///
    /// Always returns `Err(Error::Cancelled)`; connection failures start a
    /// new session after a backoff delay.
    pub async fn main_loop(&self, cancel: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let mut attempt = 0u32;
        tracing::debug!(client_id = %inner.client_id, "remote sync loop started");

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = inner.run_session(&cancel, &mut attempt) => result,
            };

            match result {
                Err(err) if err.is_cancelled() => {
                    inner.on_stop();
                    inner.flush_writes().await;
                    inner.server.disconnect().await;
                    tracing::debug!("remote sync loop stopped");
                    return Err(Error::Cancelled);
                }
                Err(err) => {
                    attempt += 1;
                    let delay = inner.config.backoff.delay(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "sync session failed, reconnecting");
                    let message = err.to_string();
                    inner.status.send_modify(|status| {
                        status.loop_error = Some(message);
                        status.loop_retrying = true;
                    });
                    inner.server.disconnect().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(()) => {
                    tracing::debug!("sync session ended, reconnecting");
                }
            }
        }
    }
}

async fn next_server_update(subscription: &mut Option<mpsc::Receiver<ServerUpdate>>) -> Option<ServerUpdate> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl RemoteInner {
    fn update_doc(&self, doc_id: &str, f: impl FnOnce(&mut RemoteDocState)) {
        self.status.send_if_modified(|status| match status.docs.get_mut(doc_id) {
            Some(doc) => {
                let before = doc.clone();
                f(doc);
                *doc != before
            }
            None => false,
        });
    }

    async fn request<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Network(format!(
                "request timed out after {:?}",
                self.config.request_timeout
            ))),
        }
    }

    /// Run a storage write to completion even if the caller is dropped.
    ///
    /// The write is tracked; [`Self::flush_writes`] waits for it.
    async fn persist<F>(&self, write: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.writes
            .spawn(write)
            .await
            .map_err(|err| Error::StorageUnavailable(err.to_string()))?
    }

    /// Wait for every write started through [`Self::persist`].
    async fn flush_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    fn on_stop(&self) {
        for mut doc in self.docs.iter_mut() {
            doc.in_flight = false;
            doc.rerun = false;
        }
        self.status.send_if_modified(|status| {
            let mut changed = status.loop_retrying;
            status.loop_retrying = false;
            for doc in status.docs.values_mut() {
                changed |= doc.retrying;
                doc.retrying = false;
            }
            changed
        });
    }

    async fn run_session(self: &Arc<Self>, cancel: &CancellationToken, attempt: &mut u32) -> Result<()> {
        self.request(self.server.wait_for_connection()).await?;
        let mut events = self.storage.event_bus().subscribe();

        *attempt = 0;
        self.status.send_if_modified(|status| {
            let changed = status.loop_error.is_some() || status.loop_retrying;
            status.loop_error = None;
            status.loop_retrying = false;
            changed
        });

        self.queue.clear();
        let doc_ids: Vec<DocId> = self.docs.iter().map(|entry| entry.key().clone()).collect();
        for mut doc in self.docs.iter_mut() {
            doc.connected = false;
            doc.needs_pull = true;
            doc.needs_push = true;
            doc.in_flight = false;
            doc.rerun = false;
            doc.parked = false;
            doc.rejections = 0;
        }
        for doc_id in &doc_ids {
            self.update_doc(doc_id, |doc| doc.syncing = true);
        }

        let subscription = self.request(self.server.subscribe()).await?;
        self.load_known_clocks(&doc_ids).await?;
        self.refresh_server_clocks().await?;

        for doc_id in &doc_ids {
            self.queue.push(doc_id);
        }
        tracing::info!(
            docs = doc_ids.len(),
            subscribed = subscription.is_some(),
            "sync session connected"
        );

        let workers = (0..self.config.concurrency.max(1)).map(|_| self.worker(cancel));
        tokio::select! {
            _ = join_all(workers) => Ok(()),
            result = self.listen(cancel, &mut events, subscription) => result,
        }
    }

    /// Publish the server clocks recorded in storage.
    async fn load_known_clocks(&self, doc_ids: &[DocId]) -> Result<()> {
        for doc_id in doc_ids {
            if let Some(clock) = self.storage.get_server_clock(doc_id).await? {
                self.update_doc(doc_id, |doc| doc.server_clock = Some(clock));
            }
        }
        Ok(())
    }

    /// Ask the server which documents changed since the last session.
    ///
    /// Returns the ids whose server clock is newer than what was pulled.
    async fn refresh_server_clocks(&self) -> Result<Option<Vec<DocId>>> {
        let after = self.storage.workspace_clock().await?;
        let Some(clocks) = self.request(self.server.load_server_clocks(after)).await? else {
            self.clocks_known.store(false, Ordering::SeqCst);
            return Ok(None);
        };
        self.clocks_known.store(true, Ordering::SeqCst);

        let mut changed = Vec::new();
        let mut newest = after;
        for (doc_id, clock) in clocks {
            newest = newest.max(Some(clock));
            self.record_server_clock(&doc_id, clock).await?;
            if self.docs.contains_key(&doc_id) {
                changed.push(doc_id);
            }
        }
        if let Some(newest) = newest {
            self.storage.set_workspace_clock(newest).await?;
        }
        tracing::debug!(changed = changed.len(), "refreshed server clocks");
        Ok(Some(changed))
    }

    async fn record_server_clock(&self, doc_id: &str, clock: ServerClock) -> Result<()> {
        let storage = self.storage.clone();
        let id = doc_id.to_string();
        self.persist(async move { storage.set_server_clock(&id, clock).await }).await?;
        self.update_doc(doc_id, |doc| {
            if doc.server_clock.map_or(true, |current| clock > current) {
                doc.server_clock = Some(clock);
            }
        });
        Ok(())
    }

    /// Queue work for a document.
    fn schedule(&self, doc_id: &str, pull: bool, push: bool) {
        {
            let Some(mut doc) = self.docs.get_mut(doc_id) else {
                return;
            };
            doc.needs_pull |= pull;
            doc.needs_push |= push;
            doc.parked = false;
            doc.rejections = 0;
            if doc.in_flight {
                doc.rerun = true;
            }
        }
        self.update_doc(doc_id, |doc| doc.syncing = true);
        self.queue.push(doc_id);
    }

    async fn listen(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        events: &mut broadcast::Receiver<DocEvent>,
        mut subscription: Option<mpsc::Receiver<ServerUpdate>>,
    ) -> Result<()> {
        let mut poll = match (&subscription, self.config.pull_interval) {
            (None, Some(every)) => {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                Some(interval)
            }
            _ => None,
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = events.recv() => match event {
                    Ok(DocEvent::ClientUpdateCommitted { client_id, doc_id, .. }) if client_id == self.client_id => {
                        self.schedule(&doc_id, false, true);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "missed storage events, pushing every doc");
                        let doc_ids: Vec<DocId> = self.docs.iter().map(|entry| entry.key().clone()).collect();
                        for doc_id in doc_ids {
                            self.schedule(&doc_id, false, true);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::StorageUnavailable("event bus closed".into()));
                    }
                },
                update = next_server_update(&mut subscription) => match update {
                    Some(update) => self.on_server_update(update).await,
                    None => return Err(Error::Network("server subscription closed".into())),
                },
                _ = next_tick(&mut poll) => {
                    match self.refresh_server_clocks().await? {
                        Some(changed) => {
                            for doc_id in changed {
                                self.schedule(&doc_id, true, false);
                            }
                        }
                        None => {
                            let doc_ids: Vec<DocId> = self.docs.iter().map(|entry| entry.key().clone()).collect();
                            for doc_id in doc_ids {
                                self.schedule(&doc_id, true, false);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn on_server_update(&self, update: ServerUpdate) {
        let ready = self
            .local_status
            .borrow()
            .docs
            .get(&update.doc_id)
            .is_some_and(|doc| doc.ready);
        let handle = self.docs.get(&update.doc_id).map(|doc| doc.handle.clone());
        let Some(handle) = handle else {
            return;
        };

        tracing::debug!(doc_id = %update.doc_id, clock = %update.clock, "server update received");
        if ready {
            if let Err(err) = handle.apply_update(&update.update, UpdateOrigin::Remote) {
                tracing::warn!(doc_id = %update.doc_id, error = %err, "failed to apply server update");
            }
        }
        if let Err(err) = self.record_server_clock(&update.doc_id, update.clock).await {
            tracing::warn!(doc_id = %update.doc_id, error = %err, "failed to record server clock");
        }
        self.schedule(&update.doc_id, true, false);
    }

    async fn worker(self: &Arc<Self>, cancel: &CancellationToken) {
        loop {
            let doc_id = self.queue.next().await;
            self.run_job(&doc_id, cancel).await;
        }
    }

    async fn run_job(self: &Arc<Self>, doc_id: &str, cancel: &CancellationToken) {
        let (handle, pull, push) = {
            let Some(mut doc) = self.docs.get_mut(doc_id) else {
                return;
            };
            if doc.in_flight {
                doc.rerun = true;
                return;
            }
            if doc.parked || !doc.has_work() {
                return;
            }
            doc.in_flight = true;
            let pull = std::mem::take(&mut doc.needs_pull) || !doc.connected;
            let push = std::mem::take(&mut doc.needs_push);
            (doc.handle.clone(), pull, push)
        };

        self.update_doc(doc_id, |doc| doc.syncing = true);
        let result = self.sync_doc(doc_id, &handle, pull, push).await;

        let rerun = match self.docs.get_mut(doc_id) {
            Some(mut doc) => {
                doc.in_flight = false;
                if result.is_ok() {
                    doc.connected = true;
                } else {
                    doc.needs_pull |= pull;
                    doc.needs_push |= push;
                }
                std::mem::take(&mut doc.rerun)
            }
            None => false,
        };
        self.finish(doc_id, result, rerun, cancel);
    }

    #[tracing::instrument(skip(self, handle), fields(client_id = %self.client_id))]
    async fn sync_doc(&self, doc_id: &str, handle: &Arc<dyn SyncDoc>, pull: bool, push: bool) -> Result<()> {
        self.wait_local(doc_id, |doc| doc.ready).await?;
        if pull && self.should_pull(doc_id).await? {
            self.pull(doc_id, handle).await?;
        }
        if push || pull {
            self.push(doc_id, handle).await?;
        }
        Ok(())
    }

    async fn wait_local(&self, doc_id: &str, pred: impl Fn(&crate::state::LocalDocState) -> bool) -> Result<()> {
        let mut local = self.local_status.clone();
        local
            .wait_for(|status| status.docs.get(doc_id).map_or(true, &pred))
            .await
            .map(|_| ())
            .map_err(|_| Error::Cancelled)
    }

    async fn should_pull(&self, doc_id: &str) -> Result<bool> {
        if !self.clocks_known.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let pulled = self.storage.pulled_clock(doc_id).await?;
        let server = self.storage.get_server_clock(doc_id).await?;
        Ok(match (server, pulled) {
            (Some(server), Some(pulled)) => server > pulled,
            (_, None) => true,
            (None, Some(_)) => false,
        })
    }

    async fn pull(&self, doc_id: &str, handle: &Arc<dyn SyncDoc>) -> Result<()> {
        let mut since = self.storage.pulled_clock(doc_id).await?;
        loop {
            let page = self.request(self.server.pull(doc_id, since)).await?;
            for update in page.updates.iter().filter(|update| !update.is_empty()) {
                handle.apply_update(update, UpdateOrigin::Remote)?;
            }

            if since.map_or(true, |since| page.clock > since) {
                // the pulled updates must be durable before the cursor moves
                self.wait_local(doc_id, |doc| !doc.saving).await?;
                let storage = self.storage.clone();
                let id = doc_id.to_string();
                let clock = page.clock;
                self.persist(async move { storage.set_pulled_clock(&id, clock).await }).await?;
                self.record_server_clock(doc_id, clock).await?;
            }
            tracing::debug!(doc_id, updates = page.updates.len(), clock = %page.clock, "pulled");

            since = Some(page.clock);
            if !page.has_more {
                return Ok(());
            }
        }
    }

    async fn push(&self, doc_id: &str, handle: &Arc<dyn SyncDoc>) -> Result<()> {
        let seq = self.storage.seq_num(doc_id).await?;
        let pushed_seq = self.storage.pushed_seq_num(doc_id).await?;
        let marker = self.storage.push_marker(doc_id).await?;
        if marker.is_some() && seq <= pushed_seq {
            self.update_doc(doc_id, |doc| doc.pushed_seq = doc.pushed_seq.max(seq));
            return Ok(());
        }

        let diff = handle.encode_diff(marker.as_deref())?;
        if diff.is_empty {
            let storage = self.storage.clone();
            let id = doc_id.to_string();
            self.persist(async move { storage.set_pushed_seq_num(&id, seq).await }).await?;
            self.update_doc(doc_id, |doc| doc.pushed_seq = doc.pushed_seq.max(seq));
            return Ok(());
        }

        let since = self.storage.pulled_clock(doc_id).await?;
        let clock = self.request(self.server.push(doc_id, &diff.update, since)).await?;
        tracing::debug!(doc_id, seq, %clock, bytes = diff.update.len(), "pushed");

        let storage = self.storage.clone();
        let id = doc_id.to_string();
        let marker = diff.marker;
        self.persist(async move {
            storage.set_push_marker(&id, marker).await?;
            storage.set_pushed_seq_num(&id, seq).await?;
            storage.set_pushed_clock(&id, clock).await
        })
        .await?;
        self.update_doc(doc_id, |doc| doc.pushed_seq = doc.pushed_seq.max(seq));
        self.record_server_clock(doc_id, clock).await
    }

    fn finish(self: &Arc<Self>, doc_id: &str, result: Result<()>, rerun: bool, cancel: &CancellationToken) {
        let err = match result {
            Ok(()) => {
                let pending = match self.docs.get_mut(doc_id) {
                    Some(mut doc) => {
                        doc.attempts = 0;
                        doc.rejections = 0;
                        rerun || doc.needs_pull || doc.needs_push
                    }
                    None => false,
                };
                self.update_doc(doc_id, |doc| {
                    doc.retrying = false;
                    doc.error_message = None;
                    doc.syncing = pending;
                });
                if pending {
                    self.queue.push(doc_id);
                }
                return;
            }
            Err(err) if err.is_cancelled() => return,
            Err(err) => err,
        };

        let (attempt, parked) = {
            let Some(mut doc) = self.docs.get_mut(doc_id) else {
                return;
            };
            if err.is_retryable() {
                doc.attempts += 1;
            } else {
                doc.rejections += 1;
                doc.parked = doc.rejections >= self.config.max_rejections;
            }
            (doc.attempts + doc.rejections, doc.parked)
        };

        let message = err.to_string();
        if parked {
            tracing::error!(doc_id, error = %err, "giving up on doc until it changes");
            self.update_doc(doc_id, |doc| {
                doc.retrying = false;
                doc.error_message = Some(message);
            });
            return;
        }

        let delay = self.config.backoff.delay(attempt);
        tracing::warn!(doc_id, attempt, ?delay, error = %err, "sync failed, retrying");
        self.update_doc(doc_id, |doc| {
            doc.retrying = true;
            doc.error_message = Some(message);
        });

        let weak = Arc::downgrade(self);
        let cancel = cancel.clone();
        let doc_id = doc_id.to_string();
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
}
