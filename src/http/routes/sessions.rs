use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::http::error::ApiError;
use crate::AppContext;

/// `GET /api/sessions` — redacted entries.
pub async fn list(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({ "sessions": ctx.sessions.list_all().await }))
}

/// `DELETE /api/sessions/:id`.
pub async fn end(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.sessions.end(&id).await {
        return Err(ApiError::NotFound(format!("session {id}")));
    }
    Ok(Json(json!({ "ended": true })))
}
