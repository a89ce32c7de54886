//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections per workspace and fans out
//! notifications.

use std::sync::Arc;

use dashmap::DashMap;
use docsync_engine::server::wire::ServerMessage;
use tokio::sync::mpsc;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    pub workspace_id: String,
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Connection IDs per workspace.
    by_workspace: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection and return its ID.
    pub fn register(&self, workspace_id: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                workspace_id: workspace_id.clone(),
                sender,
            },
        );
        self.by_workspace
            .entry(workspace_id)
            .or_default()
            .push(conn_id.clone());

        tracing::debug!(conn_id = %conn_id, "WebSocket connection registered");
        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return;
        };
        if let Some(mut conn_ids) = self.by_workspace.get_mut(&conn.workspace_id) {
            conn_ids.retain(|id| id != conn_id);
            if conn_ids.is_empty() {
                drop(conn_ids);
                self.by_workspace.remove(&conn.workspace_id);
            }
        }
        tracing::debug!(conn_id = %conn_id, workspace_id = %conn.workspace_id, "WebSocket connection unregistered");
    }

    /// Send `message` to every connection of the workspace except `except`.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_to_workspace(&self, workspace_id: &str, except: Option<&str>, message: ServerMessage) -> usize {
        let conn_ids = match self.by_workspace.get(workspace_id) {
            Some(ids) => ids.value().clone(),
            None => return 0,
        };

        conn_ids
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .filter(|id| self.send_to(id, message.clone()))
            .count()
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of workspaces with at least one connection.
    pub fn workspace_count(&self) -> usize {
        self.by_workspace.len()
    }
}
