//! SPA static fallback — unknown non-API GETs serve the built web UI, with
//! index.html as the catch-all so client-side routing works.

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::path::Path;
use std::sync::Arc;

use crate::http::error::ApiError;
use crate::AppContext;

pub async fn fallback(
    State(ctx): State<Arc<AppContext>>,
    method: Method,
    uri: Uri,
) -> Response {
    let path = uri.path();

    // Unknown API routes are JSON 404s, never HTML.
    if path.starts_with("/api") {
        return ApiError::NotFound(path.to_string()).into_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(web_root) = ctx.config.web_root.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Reject traversal before touching the filesystem.
    let relative = path.trim_start_matches('/');
    if relative.split('/').any(|seg| seg == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let candidate = if relative.is_empty() {
        web_root.join("index.html")
    } else {
        web_root.join(relative)
    };

    match tokio::fs::read(&candidate).await {
        Ok(bytes) => file_response(&candidate, bytes),
        // Anything unresolved falls back to the SPA entry point.
        Err(_) => match tokio::fs::read(web_root.join("index.html")).await {
            Ok(bytes) => file_response(Path::new("index.html"), bytes),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
    }
}

fn file_response(path: &Path, bytes: Vec<u8>) -> Response {
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript",
        Some("css") => "text/css",
        Some("json") | Some("map") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    };
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}
