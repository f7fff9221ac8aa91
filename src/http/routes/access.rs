//! Legacy access-token endpoints, kept for pre-pairing clients.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppContext;

/// `POST /api/access/rotate` — mint a new access token. Sessions held under
/// the old token are invalidated immediately.
pub async fn rotate(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let old = ctx.credentials.access_token().await;
    let token = ctx.credentials.rotate_access_token().await;
    let ended = ctx.sessions.end_sessions_for_token(&old).await;
    Json(json!({ "token": token, "endedSessions": ended }))
}

/// `GET /api/access/info`.
pub async fn info(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "active": true,
        "serverId": ctx.identity.server_id().await,
    }))
}
