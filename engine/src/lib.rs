//! # Docsync Engine
//!
//! A local-first synchronization engine for mergeable (CRDT) documents.
//!
//! The engine keeps a set of live documents durable in local storage and in
//! sync with a server while the client is only intermittently connected, and
//! answers two questions without races: "is my edit durable?" and "am I
//! fully synced?".
//!
//! ## Architecture
//!
//! - [`DocEngineLocalPart`] observes every registered document and writes
//!   coalesced diffs to storage, tracking `ready` and `saving` per document.
//! - [`DocEngineRemotePart`] pushes committed local changes to a
//!   [`DocServer`] and pulls remote changes, tracking `syncing` and
//!   `retrying`, with bounded concurrency, priorities and backoff.
//! - [`DocEngine`] runs both parts under one cancellation token and exposes
//!   the combined state.
//!
//! The engine never looks inside documents. Everything it needs is on the
//! [`SyncDoc`] trait; [`MemoryDoc`] is a small reference implementation.
//!
//! ## State
//!
//! Each part publishes its per-document map through a `tokio::sync::watch`
//! channel. [`DocState`] and [`EngineState`] are pure reductions over those
//! snapshots, so `saving_count` always equals the number of documents with
//! `saving == true`.
//!
//! ## Quick Start
//!
//! ```rust
//! use docsync_engine::{DocEngine, EngineConfig, MemoryDoc, MemoryDocServer, MemoryDocStorage};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> docsync_engine::Result<()> {
//! let storage = Arc::new(MemoryDocStorage::new());
//! let server = Arc::new(MemoryDocServer::new());
//! let engine = DocEngine::new(storage, Some(server), EngineConfig::default())?;
//!
//! let doc = Arc::new(MemoryDoc::new("page-1"));
//! engine.add_doc(doc.clone(), true);
//! engine.start().await;
//!
//! engine.wait_for_ready("page-1").await?;
//! doc.set("title", "Hello");
//! engine.wait_for_synced().await?;
//!
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `sqlite` (default): [`SqliteDocStorage`] backed by sqlx
//! - `http`: [`HttpDocServer`] talking to `docsync-server`

pub mod clock;
pub mod config;
pub mod doc;
pub mod engine;
pub mod error;
pub mod event;
pub mod local;
pub mod queue;
pub mod remote;
pub mod server;
pub mod state;
pub mod storage;

// Re-export main types at crate root
pub use clock::ServerClock;
pub use config::{BackoffConfig, EngineConfig};
pub use doc::{DocDiff, MemoryDoc, SyncDoc, UpdateOrigin};
pub use engine::DocEngine;
pub use error::{Error, Result};
pub use event::{DocEvent, DocEventBus, MemoryDocEventBus};
pub use local::DocEngineLocalPart;
pub use queue::AsyncPriorityQueue;
pub use remote::DocEngineRemotePart;
#[cfg(feature = "http")]
pub use server::HttpDocServer;
pub use server::{DocServer, MemoryDocServer, PullResult, ServerUpdate};
pub use state::{DocState, EngineState, StateWatcher};
#[cfg(feature = "sqlite")]
pub use storage::SqliteDocStorage;
pub use storage::{ByteKv, DocStorage, DocStorageAdapter, MemoryDocStorage};

/// Type aliases for clarity
pub type DocId = String;
pub type Priority = i64;
