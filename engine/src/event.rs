//! In-process notifications about committed document updates.
//!
//! Every engine attached to a storage publishes what it commits. The remote
//! part of the committing engine reacts to its own client updates (push),
//! while other engines sharing the same storage apply the update to their
//! live documents.

use tokio::sync::broadcast;

/// Default buffer of [`MemoryDocEventBus`].
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A committed change to a document's stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocEvent {
    /// A local edit was written to storage and got a new local seq number.
    ClientUpdateCommitted {
        client_id: String,
        doc_id: String,
        update: Vec<u8>,
        seq_num: u64,
    },
    /// An update received from the server was written to storage.
    ServerUpdateCommitted {
        client_id: String,
        doc_id: String,
        update: Vec<u8>,
    },
}

impl DocEvent {
    /// Client that committed the update.
    pub fn client_id(&self) -> &str {
        match self {
            DocEvent::ClientUpdateCommitted { client_id, .. }
            | DocEvent::ServerUpdateCommitted { client_id, .. } => client_id,
        }
    }

    pub fn doc_id(&self) -> &str {
        match self {
            DocEvent::ClientUpdateCommitted { doc_id, .. }
            | DocEvent::ServerUpdateCommitted { doc_id, .. } => doc_id,
        }
    }

    pub fn update(&self) -> &[u8] {
        match self {
            DocEvent::ClientUpdateCommitted { update, .. }
            | DocEvent::ServerUpdateCommitted { update, .. } => update,
        }
    }
}

/// Pub/sub channel for [`DocEvent`]s.
pub trait DocEventBus: Send + Sync {
    /// Publish an event. Never blocks and never fails; with no subscriber the
    /// event is dropped.
    fn emit(&self, event: DocEvent);

    /// Receive every event emitted after this call.
    fn subscribe(&self) -> broadcast::Receiver<DocEvent>;
}

/// [`DocEventBus`] backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct MemoryDocEventBus {
    sender: broadcast::Sender<DocEvent>,
}

impl Default for MemoryDocEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Slow subscribers falling more than `capacity` events behind observe
    /// `RecvError::Lagged`.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl DocEventBus for MemoryDocEventBus {
    fn emit(&self, event: DocEvent) {
        tracing::trace!(doc_id = %event.doc_id(), client_id = %event.client_id(), "doc event");
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.sender.subscribe()
    }
}
