//! JSON messages exchanged with `docsync-server`.
//!
//! Binary updates travel as standard base64. WebSocket messages are tagged
//! by a `type` field and use snake_case names.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the pusher's WebSocket connection id, so the server does
/// not echo the update back to it.
pub const CONNECTION_HEADER: &str = "x-docsync-connection";

pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

/// Body of `POST /workspaces/{workspace_id}/docs/{doc_id}/updates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Base64 update
    pub update: String,
    /// Newest clock the client has pulled
    #[serde(default)]
    pub since: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub clock: u64,
    /// False when an identical update was already stored
    pub accepted: bool,
}

/// Query of `GET /workspaces/{workspace_id}/docs/{doc_id}/updates`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub since: Option<u64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Base64 updates in clock order
    pub updates: Vec<String>,
    pub clock: u64,
    pub has_more: bool,
}

/// Query of `GET /workspaces/{workspace_id}/clocks`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClocksQuery {
    #[serde(default)]
    pub after: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClocksResponse {
    pub clocks: HashMap<String, u64>,
}

/// Messages sent from client to server over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message of every connection.
    Connected { connection_id: String },

    /// Another client pushed an update.
    ServerUpdate {
        doc_id: String,
        /// Base64 update
        update: String,
        clock: u64,
        /// Unix milliseconds the update was stored at
        timestamp: i64,
    },

    /// Response to ping.
    Pong,

    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn server_update(doc_id: impl Into<String>, update: &[u8], clock: u64, timestamp: i64) -> Self {
        ServerMessage::ServerUpdate {
            doc_id: doc_id.into(),
            update: encode_bytes(update),
            clock,
            timestamp,
        }
    }
}
