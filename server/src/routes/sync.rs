//! Sync endpoint routes.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use docsync_engine::server::wire::{
    ClocksQuery, ClocksResponse, PullQuery, PullResponse, PushRequest, PushResponse, CONNECTION_HEADER,
};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_clocks, handle_pull, handle_push, handle_websocket_connection};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/workspaces/{workspace_id}/docs/{doc_id}/updates",
            get(pull_handler).post(push_handler),
        )
        .route("/workspaces/{workspace_id}/clocks", get(clocks_handler))
        .route("/workspaces/{workspace_id}/ws", get(ws_handler))
}

/// POST /workspaces/{workspace_id}/docs/{doc_id}/updates - Push an update.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((workspace_id, doc_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let origin = headers.get(CONNECTION_HEADER).and_then(|value| value.to_str().ok());
    let response = handle_push(&state.pool, &state.conn_manager, &workspace_id, &doc_id, origin, request).await?;
    Ok(Json(response))
}

/// GET /workspaces/{workspace_id}/docs/{doc_id}/updates - Pull updates.
async fn pull_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((workspace_id, doc_id)): Path<(String, String)>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state.pool, &workspace_id, &doc_id, query).await?;
    Ok(Json(response))
}

/// GET /workspaces/{workspace_id}/clocks - Latest clock per changed doc.
async fn clocks_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(workspace_id): Path<String>,
    Query(query): Query<ClocksQuery>,
) -> Result<Json<ClocksResponse>> {
    let response = handle_clocks(&state.pool, &workspace_id, query).await?;
    Ok(Json(response))
}

/// GET /workspaces/{workspace_id}/ws - Subscribe to server updates.
async fn ws_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(workspace_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let conn_manager = state.conn_manager.clone();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, conn_manager, workspace_id))
}
