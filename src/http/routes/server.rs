use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::http::error::ApiError;
use crate::AppContext;

/// `GET /api/server` — public identity (id, name, public key) plus the relay
/// room id the mobile client joins for remote access.
pub async fn info(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let identity = ctx.identity.get_public_identity().await;
    Json(json!({
        "serverId": identity.server_id,
        "serverName": identity.server_name,
        "publicKey": identity.public_key,
        "relayRoomId": ctx.identity.get_relay_room_id().await,
    }))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    name: String,
}

/// `POST /api/server/name {name}` — explicit rename, the only identity
/// mutation besides passphrase regeneration.
pub async fn rename(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::Malformed("server name must not be empty".to_string()));
    }
    ctx.identity.set_server_name(name).await;
    Ok(Json(json!({ "success": true, "serverName": name })))
}
