//! Client side of the document server protocol.
//!
//! The remote part only depends on the [`DocServer`] trait. A server stores
//! opaque updates per document and stamps each accepted update with a
//! [`ServerClock`]; pulling "since" a clock returns every update stamped
//! after it.

mod memory;
pub mod wire;

#[cfg(feature = "http")]
mod http;

pub use memory::{MemoryDocServer, ServerCall};

#[cfg(feature = "http")]
pub use http::HttpDocServer;

use crate::clock::ServerClock;
use crate::error::Result;
use crate::DocId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// One page of updates returned by [`DocServer::pull`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullResult {
    /// Updates in server order, each an opaque document update
    pub updates: Vec<Vec<u8>>,
    /// Clock of the newest returned update; the cursor for the next pull
    pub clock: ServerClock,
    /// More updates are available after `clock`
    pub has_more: bool,
}

/// An update another client pushed, delivered over a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpdate {
    pub doc_id: DocId,
    pub update: Vec<u8>,
    pub clock: ServerClock,
}

/// Transport to the document server.
///
/// Push must be idempotent: retrying a push whose response was lost must not
/// duplicate its effect.
#[async_trait]
pub trait DocServer: Send + Sync {
    /// Resolve once the server is reachable.
    async fn wait_for_connection(&self) -> Result<()>;

    /// Store `update` for `doc_id`. `since` is the newest clock the client
    /// has pulled. Returns the clock assigned to the update.
    async fn push(&self, doc_id: &str, update: &[u8], since: Option<ServerClock>) -> Result<ServerClock>;

    /// Fetch updates stamped after `since` (all updates for `None`).
    async fn pull(&self, doc_id: &str, since: Option<ServerClock>) -> Result<PullResult>;

    /// Newest clock of every document changed after `after`.
    ///
    /// `None` means the server cannot answer, so every document is pulled.
    async fn load_server_clocks(
        &self,
        _after: Option<ServerClock>,
    ) -> Result<Option<HashMap<DocId, ServerClock>>> {
        Ok(None)
    }

    /// Stream of updates pushed by other clients, if the server offers one.
    ///
    /// The stream closing means the session is lost.
    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<ServerUpdate>>> {
        Ok(None)
    }

    /// Release the connection.
    async fn disconnect(&self) {}
}
