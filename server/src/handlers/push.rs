//! Push handler - stores an update and notifies other connections.

use crate::db;
use crate::error::{AppError, Result};
use crate::websocket::ConnectionManager;
use docsync_engine::server::wire::{decode_bytes, PushRequest, PushResponse, ServerMessage};
use sqlx::PgPool;

/// Decode the base64 update of a push request.
pub fn decode_update(encoded: &str) -> Result<Vec<u8>> {
    let update = decode_bytes(encoded).map_err(|e| AppError::BadRequest(format!("Invalid base64 update: {e}")))?;
    if update.is_empty() {
        return Err(AppError::Unprocessable("empty update".to_string()));
    }
    Ok(update)
}

/// Process a push for one document.
///
/// `origin` is the WebSocket connection of the pushing client; it is not
/// notified of its own update.
#[tracing::instrument(skip(pool, conn_manager, request), fields(len = request.update.len()))]
pub async fn handle_push(
    pool: &PgPool,
    conn_manager: &ConnectionManager,
    workspace_id: &str,
    doc_id: &str,
    origin: Option<&str>,
    request: PushRequest,
) -> Result<PushResponse> {
    let update = decode_update(&request.update)?;
    let inserted = db::insert_update(pool, workspace_id, doc_id, &update).await?;
    let clock = inserted.update.id as u64;

    if inserted.accepted {
        let message = ServerMessage::server_update(
            &inserted.update.doc_id,
            &inserted.update.data,
            clock,
            inserted.update.created_at.timestamp_millis(),
        );
        let sent = conn_manager.broadcast_to_workspace(workspace_id, origin, message);
        tracing::debug!(clock, since = ?request.since, sent_to = sent, "update stored");
    } else {
        tracing::debug!(clock, "duplicate update ignored");
    }

    Ok(PushResponse {
        clock,
        accepted: inserted.accepted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_engine::server::wire::encode_bytes;

    #[test]
    fn decode_rejects_garbage_and_empty() {
        assert_eq!(decode_update(&encode_bytes(b"abc")).unwrap(), b"abc");
        assert!(matches!(decode_update("not base64!"), Err(AppError::BadRequest(_))));
        assert!(matches!(decode_update(""), Err(AppError::Unprocessable(_))));
    }
}
