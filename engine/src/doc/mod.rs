//! The document model seen by the engine.
//!
//! The engine never looks inside a document. Everything it needs is on the
//! [`SyncDoc`] trait: extract a diff since a marker, apply an update, merge
//! stored updates, and get told when the document or its sub-document graph
//! changes.

mod memory;

pub use memory::MemoryDoc;

use crate::error::Result;
use std::sync::Arc;

/// Where an update applied to a live document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// Edited in this process (editor, application code)
    Local,
    /// Received from the server
    Remote,
    /// Loaded from storage, or committed to storage by another client.
    /// Already durable, never persisted again.
    Storage,
}

/// A diff together with the marker of the state it brings a peer up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocDiff {
    /// Encoded update
    pub update: Vec<u8>,
    /// Marker of the document state the diff was taken from
    pub marker: Vec<u8>,
    /// Whether the update carries no changes
    pub is_empty: bool,
}

/// Called after every applied change with the document id and origin.
pub type UpdateObserver = Arc<dyn Fn(&str, UpdateOrigin) + Send + Sync>;

/// Called with sub-documents added to a document.
pub type SubDocObserver = Arc<dyn Fn(Vec<Arc<dyn SyncDoc>>) + Send + Sync>;

/// A mergeable document the engine can persist and sync.
///
/// Implementations use interior mutability: documents are shared between the
/// application and the engine. Observers must be invoked without holding any
/// internal lock, since they may call back into the document.
pub trait SyncDoc: Send + Sync {
    /// Stable document id.
    fn guid(&self) -> &str;

    /// Marker describing everything the document currently contains.
    fn state_marker(&self) -> Vec<u8>;

    /// Encode everything not covered by `since` (the whole state for `None`).
    ///
    /// The returned marker must describe exactly the state the diff was
    /// taken from.
    fn encode_diff(&self, since: Option<&[u8]>) -> Result<DocDiff>;

    /// Apply an update. Applying an update twice has no further effect.
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()>;

    /// Merge several encoded updates into one.
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>>;

    /// Register a mutation observer.
    fn observe_updates(&self, observer: UpdateObserver);

    /// Sub-documents currently reachable from this document.
    fn sub_docs(&self) -> Vec<Arc<dyn SyncDoc>>;

    /// Register an observer for sub-documents added later.
    fn observe_sub_docs(&self, observer: SubDocObserver);
}
