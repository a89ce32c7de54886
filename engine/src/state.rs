//! Per-document and aggregate sync state.
//!
//! Each part publishes a snapshot of its own per-document map through a
//! `watch` channel. Everything the application sees ([`DocState`],
//! [`EngineState`]) is a pure reduction over the latest snapshots, so the
//! aggregate can never drift from the per-document values.

use crate::clock::ServerClock;
use crate::error::Result;
use crate::{DocId, Error, Priority};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Local part view of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalDocState {
    /// Stored state has been loaded into the live document
    pub ready: bool,
    /// Mutations not yet written to storage
    pub saving: bool,
    pub error_message: Option<String>,
    pub priority: Priority,
    /// Seq number of the newest local update committed to storage
    pub committed_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalStatus {
    pub docs: BTreeMap<DocId, LocalDocState>,
}

/// Remote part view of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDocState {
    /// Not yet known to be in sync with the server
    pub syncing: bool,
    /// Last attempt failed, another one is scheduled
    pub retrying: bool,
    pub error_message: Option<String>,
    pub server_clock: Option<ServerClock>,
    pub priority: Priority,
    /// Seq number covered by the last push
    pub pushed_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStatus {
    pub docs: BTreeMap<DocId, RemoteDocState>,
    /// Session level failure (connection, subscription)
    pub loop_error: Option<String>,
    /// A new session is scheduled after `loop_error`
    pub loop_retrying: bool,
}

/// Combined state of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocState {
    pub ready: bool,
    pub saving: bool,
    pub syncing: bool,
    pub retrying: bool,
    pub server_clock: Option<ServerClock>,
    pub error_message: Option<String>,
}

/// Aggregate over every registered document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineState {
    pub total_doc_count: usize,
    pub syncing_count: usize,
    pub saving_count: usize,
    pub retrying_count: usize,
    pub error_message: Option<String>,
}

impl EngineState {
    /// Nothing left to save or sync.
    pub fn is_synced(&self) -> bool {
        self.syncing_count == 0 && self.saving_count == 0
    }
}

/// Combine both views of one document.
///
/// A document is syncing while the remote part says so or while it has
/// committed local updates the remote part has not pushed yet. Without a
/// remote part, `syncing` mirrors `saving`.
pub fn reduce_doc(local: &LocalDocState, remote: Option<(&RemoteDocState, &RemoteStatus)>) -> DocState {
    match remote {
        Some((doc, status)) => DocState {
            ready: local.ready,
            saving: local.saving,
            syncing: doc.syncing || local.committed_seq > doc.pushed_seq,
            retrying: doc.retrying || (status.loop_retrying && doc.syncing),
            server_clock: doc.server_clock,
            error_message: local.error_message.clone().or_else(|| doc.error_message.clone()),
        },
        None => DocState {
            ready: local.ready,
            saving: local.saving,
            syncing: local.saving,
            retrying: false,
            server_clock: None,
            error_message: local.error_message.clone(),
        },
    }
}

/// Per-document states of every registered document.
pub fn reduce_docs(local: &LocalStatus, remote: Option<&RemoteStatus>) -> BTreeMap<DocId, DocState> {
    let default_remote = RemoteDocState::default();
    local
        .docs
        .iter()
        .map(|(id, local_doc)| {
            let remote = remote.map(|status| (status.docs.get(id).unwrap_or(&default_remote), status));
            (id.clone(), reduce_doc(local_doc, remote))
        })
        .collect()
}

/// Aggregate state as a pure function of both snapshots.
pub fn reduce_engine(local: &LocalStatus, remote: Option<&RemoteStatus>) -> EngineState {
    let docs = reduce_docs(local, remote);
    let doc_error = docs.values().find_map(|doc| doc.error_message.clone());
    EngineState {
        total_doc_count: docs.len(),
        syncing_count: docs.values().filter(|doc| doc.syncing).count(),
        saving_count: docs.values().filter(|doc| doc.saving).count(),
        retrying_count: docs.values().filter(|doc| doc.retrying).count(),
        error_message: remote
            .and_then(|status| status.loop_error.clone())
            .or(doc_error),
    }
}

/// Read access to the live state of an engine.
#[derive(Debug, Clone)]
pub struct StateWatcher {
    local: watch::Receiver<LocalStatus>,
    remote: Option<watch::Receiver<RemoteStatus>>,
}

impl StateWatcher {
    pub fn new(local: watch::Receiver<LocalStatus>, remote: Option<watch::Receiver<RemoteStatus>>) -> Self {
        Self { local, remote }
    }

    pub fn engine_state(&self) -> EngineState {
        let local = self.local.borrow();
        let remote = self.remote.as_ref().map(|rx| rx.borrow());
        reduce_engine(&local, remote.as_deref())
    }

    pub fn doc_state(&self, doc_id: &str) -> Option<DocState> {
        let local = self.local.borrow();
        let remote = self.remote.as_ref().map(|rx| rx.borrow());
        let local_doc = local.docs.get(doc_id)?;
        let default_remote = RemoteDocState::default();
        let remote = remote
            .as_deref()
            .map(|status| (status.docs.get(doc_id).unwrap_or(&default_remote), status));
        Some(reduce_doc(local_doc, remote))
    }

    /// Engine state and every document state, taken from one snapshot.
    pub fn snapshot(&self) -> (EngineState, BTreeMap<DocId, DocState>) {
        let local = self.local.borrow();
        let remote = self.remote.as_ref().map(|rx| rx.borrow());
        (
            reduce_engine(&local, remote.as_deref()),
            reduce_docs(&local, remote.as_deref()),
        )
    }

    /// Mark the current snapshots as seen.
    fn mark_seen(&mut self) {
        self.local.borrow_and_update();
        if let Some(remote) = self.remote.as_mut() {
            remote.borrow_and_update();
        }
    }

    /// Wait until either part publishes a new snapshot.
    pub async fn changed(&mut self) -> Result<()> {
        let changed = match self.remote.as_mut() {
            Some(remote) => tokio::select! {
                changed = self.local.changed() => changed,
                changed = remote.changed() => changed,
            },
            None => self.local.changed().await,
        };
        changed.map_err(|_| Error::Cancelled)
    }

    /// Resolve with the first engine state satisfying `pred`, immediately if
    /// the current one does.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&EngineState) -> bool) -> Result<EngineState> {
        loop {
            self.mark_seen();
            let state = self.engine_state();
            if pred(&state) {
                return Ok(state);
            }
            self.changed().await?;
        }
    }

    /// Resolve with the first state of `doc_id` satisfying `pred`.
    pub async fn wait_for_doc(
        &mut self,
        doc_id: &str,
        mut pred: impl FnMut(&DocState) -> bool,
    ) -> Result<DocState> {
        loop {
            self.mark_seen();
            if let Some(state) = self.doc_state(doc_id) {
                if pred(&state) {
                    return Ok(state);
                }
            }
            self.changed().await?;
        }
    }
}
