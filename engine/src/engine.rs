//! The engine: local and remote parts behind one handle.

use crate::config::EngineConfig;
use crate::doc::SyncDoc;
use crate::error::Result;
use crate::local::DocEngineLocalPart;
use crate::remote::DocEngineRemotePart;
use crate::server::DocServer;
use crate::state::{DocState, EngineState, StateWatcher};
use crate::storage::{DocStorage, DocStorageAdapter};
use crate::Priority;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Priority offset of a sub-document relative to its parent.
pub const SUB_DOC_PRIORITY_OFFSET: Priority = -1;

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct EngineInner {
    client_id: String,
    config: EngineConfig,
    storage: DocStorageAdapter,
    local: DocEngineLocalPart,
    remote: Option<DocEngineRemotePart>,
    watcher: StateWatcher,
    run: Mutex<Option<RunHandle>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let run = self.run.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = run.take() {
            run.cancel.cancel();
        }
    }
}

/// Keeps a collection of documents persisted and in sync with a server.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct DocEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for DocEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocEngine")
            .field("client_id", &self.inner.client_id)
            .field("remote", &self.inner.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl DocEngine {
    /// Create an engine over `storage`, syncing with `server` if given.
    ///
    /// Nothing runs until [`DocEngine::start`].
    pub fn new(
        storage: Arc<dyn DocStorage>,
        server: Option<Arc<dyn DocServer>>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let client_id = uuid::Uuid::new_v4().to_string();
        let storage = DocStorageAdapter::new(storage, config.storage_timeout);

        let local = DocEngineLocalPart::new(client_id.clone(), storage.clone(), config.clone());
        let remote = server.map(|server| {
            DocEngineRemotePart::new(
                client_id.clone(),
                storage.clone(),
                server,
                config.clone(),
                local.status(),
            )
        });
        let watcher = StateWatcher::new(local.status(), remote.as_ref().map(|remote| remote.status()));

        tracing::debug!(client_id = %client_id, remote = remote.is_some(), "doc engine created");
        Ok(Self {
            inner: Arc::new(EngineInner {
                client_id,
                config,
                storage,
                local,
                remote,
                watcher,
                run: Mutex::new(None),
            }),
        })
    }

    /// Engine that only persists, without a server.
    pub fn local_only(storage: Arc<dyn DocStorage>, config: EngineConfig) -> Result<Self> {
        Self::new(storage, None, config)
    }

    /// Id this engine commits local updates under.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn local(&self) -> &DocEngineLocalPart {
        &self.inner.local
    }

    pub fn remote(&self) -> Option<&DocEngineRemotePart> {
        self.inner.remote.as_ref()
    }

    /// Start (or restart) the sync loops.
    pub async fn start(&self) {
        self.stop().await;

        let cancel = CancellationToken::new();
        let local = self.inner.local.clone();
        let remote = self.inner.remote.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let local_run = async {
                if let Err(err) = local.main_loop(token.clone()).await {
                    if !err.is_cancelled() {
                        tracing::error!(error = %err, "local sync loop crashed");
                    }
                }
            };
            let remote_run = async {
                if let Some(remote) = remote {
                    if let Err(err) = remote.main_loop(token.clone()).await {
                        if !err.is_cancelled() {
                            tracing::error!(error = %err, "remote sync loop crashed");
                        }
                    }
                }
            };
            tokio::join!(local_run, remote_run);
        });

        *self.inner.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunHandle { cancel, task });
        tracing::info!(client_id = %self.inner.client_id, "doc engine started");
    }

    /// Stop the sync loops and wait for them to exit.
    ///
    /// A storage write in progress completes; network requests are abandoned.
    pub async fn stop(&self) {
        let run = self.inner.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(run) = run else {
            return;
        };
        run.cancel.cancel();
        if let Err(err) = run.task.await {
            tracing::error!(error = %err, "sync task panicked");
        }
        tracing::info!(client_id = %self.inner.client_id, "doc engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// Stop the engine and forget all sync progress.
    ///
    /// Sync metadata and server clocks are cleared; document data stays.
    /// The next start pulls and pushes every document from scratch.
    pub async fn reset_sync_status(&self) -> Result<()> {
        self.stop().await;
        self.inner.storage.clear_sync_metadata().await?;
        self.inner.storage.clear_server_clocks().await?;
        self.inner.local.reset_commits();
        if let Some(remote) = &self.inner.remote {
            remote.reset();
        }
        tracing::info!(client_id = %self.inner.client_id, "sync status reset");
        Ok(())
    }

    /// Register a document (priority 0).
    ///
    /// With `with_sub_docs`, every sub-document reachable now or added later
    /// is registered too, one priority step below its parent.
    pub fn add_doc(&self, doc: Arc<dyn SyncDoc>, with_sub_docs: bool) {
        self.inner.register(doc, 0, with_sub_docs);
    }

    /// Register a document with an initial priority.
    pub fn add_doc_with_priority(&self, doc: Arc<dyn SyncDoc>, priority: Priority, with_sub_docs: bool) {
        self.inner.register(doc, priority, with_sub_docs);
    }

    /// Change scheduling priority. Higher runs first; affects future work only.
    pub fn set_priority(&self, doc_id: &str, priority: Priority) {
        self.inner.local.set_priority(doc_id, priority);
        if let Some(remote) = &self.inner.remote {
            remote.set_priority(doc_id, priority);
        }
    }

    pub fn engine_state(&self) -> EngineState {
        self.inner.watcher.engine_state()
    }

    /// `None` for unregistered documents.
    pub fn doc_state(&self, doc_id: &str) -> Option<DocState> {
        self.inner.watcher.doc_state(doc_id)
    }

    /// A watcher over the live state.
    pub fn watch_state(&self) -> StateWatcher {
        self.inner.watcher.clone()
    }

    /// Current engine state followed by every distinct later one.
    pub fn engine_state_stream(&self) -> BoxStream<'static, EngineState> {
        let watcher = self.watch_state();
        stream::unfold((watcher, None), |(mut watcher, last)| async move {
            loop {
                let state = watcher.engine_state();
                if last.as_ref() != Some(&state) {
                    return Some((state.clone(), (watcher, Some(state))));
                }
                watcher.changed().await.ok()?;
            }
        })
        .boxed()
    }

    /// Current state of `doc_id` followed by every distinct later one.
    pub fn doc_state_stream(&self, doc_id: &str) -> BoxStream<'static, Option<DocState>> {
        let watcher = self.watch_state();
        let doc_id = doc_id.to_string();
        stream::unfold((watcher, None), move |(mut watcher, last)| {
            let doc_id = doc_id.clone();
            async move {
                loop {
                    let state = watcher.doc_state(&doc_id);
                    if last.as_ref() != Some(&state) {
                        return Some((state.clone(), (watcher, Some(state))));
                    }
                    watcher.changed().await.ok()?;
                }
            }
        })
        .boxed()
    }

    /// Resolve once nothing is waiting to be written to storage.
    pub async fn wait_for_saved(&self) -> Result<()> {
        self.watch_state().wait_for(|state| state.saving_count == 0).await?;
        Ok(())
    }

    /// Resolve once nothing is waiting to be saved or synced.
    pub async fn wait_for_synced(&self) -> Result<()> {
        self.watch_state().wait_for(EngineState::is_synced).await?;
        Ok(())
    }

    /// Resolve once `doc_id` is registered and loaded from storage.
    pub async fn wait_for_ready(&self, doc_id: &str) -> Result<()> {
        self.watch_state().wait_for_doc(doc_id, |doc| doc.ready).await?;
        Ok(())
    }
}

impl EngineInner {
    fn register(self: &Arc<Self>, doc: Arc<dyn SyncDoc>, priority: Priority, with_sub_docs: bool) {
        if self.local.has_doc(doc.guid()) {
            return;
        }
        self.local.add_doc(doc.clone(), priority);
        if let Some(remote) = &self.remote {
            remote.add_doc(doc.clone(), priority);
        }
        if !with_sub_docs {
            return;
        }

        let child_priority = priority + SUB_DOC_PRIORITY_OFFSET;
        for sub_doc in doc.sub_docs() {
            self.register(sub_doc, child_priority, true);
        }

        let weak: Weak<EngineInner> = Arc::downgrade(self);
        doc.observe_sub_docs(Arc::new(move |added| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            for sub_doc in added {
                tracing::debug!(doc_id = %sub_doc.guid(), "sub doc discovered");
                inner.register(sub_doc, child_priority, true);
            }
        }));
    }
}
