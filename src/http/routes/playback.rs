//! Tunneled-compatible media surface — thin delegations to the capability
//! traits wired in at startup. A missing capability is a 503 naming the
//! service, so remote clients can distinguish "host lacks it" from failure.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::http::error::ApiError;
use crate::media::{normalize_for_mobile, PlaybackCommand};
use crate::AppContext;

/// `GET /api/playback/state`.
pub async fn state(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let playback = ctx
        .media
        .playback
        .as_ref()
        .ok_or_else(|| ApiError::UpstreamUnavailable("playback".to_string()))?;
    let state = playback.state().await?;
    Ok(Json(serde_json::to_value(state).unwrap_or_default()))
}

/// `POST /api/playback/command {command, …}`.
pub async fn command(
    State(ctx): State<Arc<AppContext>>,
    Json(cmd): Json<PlaybackCommand>,
) -> Result<Json<Value>, ApiError> {
    let playback = ctx
        .media
        .playback
        .as_ref()
        .ok_or_else(|| ApiError::UpstreamUnavailable("playback".to_string()))?;
    playback.command(cmd).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
}

/// `GET /api/search?q=…`.
pub async fn search(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let searcher = ctx
        .media
        .searcher
        .as_ref()
        .ok_or_else(|| ApiError::UpstreamUnavailable("search".to_string()))?;
    let results = searcher.search(&query.q).await?;
    Ok(Json(serde_json::to_value(results).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// `GET /api/library/tracks?offset=…&limit=…` — flat projections for the
/// mobile list views.
pub async fn library_tracks(
    State(ctx): State<Arc<AppContext>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let library = ctx
        .media
        .library
        .as_ref()
        .ok_or_else(|| ApiError::UpstreamUnavailable("library".to_string()))?;
    let tracks = library.tracks(page.offset, page.limit.min(500)).await?;
    let flat: Vec<_> = tracks.iter().map(normalize_for_mobile).collect();
    Ok(Json(json!({ "tracks": flat })))
}
