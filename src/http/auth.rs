//! The auth hook — the only place request-level authorization lives.
//!
//! Check order for every request:
//! 1. public allow-list (health, index, static assets) → pass
//! 2. internal marker header (set only by the relay injector) → pass,
//!    already authenticated by peer identity
//! 3. token from `?token=…` or `Authorization: Bearer …`
//! 4. legacy access-token check, then device-token validation
//! 5. otherwise 401
//!
//! The marker header carries a per-process random secret, is compared in
//! constant time, and is stripped before any handler sees the request, so a
//! network client cannot forge relay-injected authority.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderName;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

use crate::credentials::constant_time_eq;
use crate::AppContext;

use super::error::ApiError;

/// Marker header added by the relay injector. Value = per-process secret.
pub static INTERNAL_MARKER: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-encore-internal"));

/// How the request authenticated — attached as a request extension.
#[derive(Debug, Clone)]
pub enum AuthPrincipal {
    /// Arrived through the relay injector; peer identity already checked.
    Relay,
    /// Presented the legacy access token.
    AccessToken(String),
    /// Presented a valid combined device token.
    Device { device_id: String, token: String },
}

impl AuthPrincipal {
    /// The token owning any session this principal creates.
    pub fn owner_token(&self) -> &str {
        match self {
            AuthPrincipal::Relay => "relay",
            AuthPrincipal::AccessToken(t) => t,
            AuthPrincipal::Device { token, .. } => token,
        }
    }
}

// ─── Public allow-list ───────────────────────────────────────────────────────

const STATIC_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".map", ".png", ".jpg", ".svg", ".ico", ".webp", ".woff", ".woff2", ".ttf",
];

pub fn is_public(path: &str) -> bool {
    matches!(
        path,
        "/" | "/index.html"
            | "/api/health"
            | "/api/auth/pair"
            | "/api/auth/pair/check"
            | "/api/auth/login"
    ) || path.starts_with("/assets/")
        || STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

// ─── Rate limiting ───────────────────────────────────────────────────────────

/// Per-IP API request tracker — sliding one-minute window.
pub struct ApiRateLimiter {
    requests: HashMap<IpAddr, Vec<Instant>>,
    max_per_min: u32,
}

impl ApiRateLimiter {
    pub fn new(max_per_min: u32) -> Self {
        Self {
            requests: HashMap::new(),
            max_per_min,
        }
    }

    /// Returns `true` if the request should be allowed.
    pub fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);

        let timestamps = self.requests.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);

        if timestamps.len() >= self.max_per_min as usize {
            return false;
        }
        timestamps.push(now);
        true
    }
}

pub type SharedRateLimiter = Arc<Mutex<ApiRateLimiter>>;

// ─── Token helpers ───────────────────────────────────────────────────────────

fn token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn token_from_headers(req: &Request) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Resolve a presented token: legacy access token first, then device token.
pub async fn resolve_token(ctx: &AppContext, token: &str) -> Result<AuthPrincipal, ApiError> {
    if ctx.credentials.check_access_token(token).await {
        return Ok(AuthPrincipal::AccessToken(token.to_string()));
    }
    // Device tokens carry a ':' separator; anything else already failed the
    // access-token check above.
    if token.contains(':') {
        let device_id = ctx.devices.validate(token).await?;
        return Ok(AuthPrincipal::Device {
            device_id,
            token: token.to_string(),
        });
    }
    Err(ApiError::Unauthorized)
}

// ─── The hook ────────────────────────────────────────────────────────────────

pub async fn auth_hook(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Response {
    // The marker is stripped unconditionally; only the injector's own value
    // (checked below, constant-time) grants relay authority.
    let marker = req.headers_mut().remove(&*INTERNAL_MARKER);
    let relay_injected = marker
        .as_ref()
        .and_then(|v| v.to_str().ok())
        .map(|v| constant_time_eq(v, &ctx.internal_marker))
        .unwrap_or(false);

    let path = req.uri().path().to_string();

    if relay_injected {
        req.extensions_mut().insert(AuthPrincipal::Relay);
        return next.run(req).await;
    }

    // Per-IP rate limit on the API surface (relay-injected requests are
    // exempt — they carry no network peer and were limited client-side).
    if path.starts_with("/api") {
        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            let mut limiter = ctx.rate_limiter.lock().await;
            if !limiter.check_and_record(addr.ip()) {
                debug!(peer = %addr, "API rate limit exceeded");
                return ApiError::RateLimited.into_response();
            }
        }
    }

    if is_public(&path) {
        return next.run(req).await;
    }

    // The WebSocket endpoint authenticates inside the upgrade handler so it
    // can reply with close code 4001 instead of an HTTP error.
    if path == "/ws" {
        return next.run(req).await;
    }

    let token = token_from_query(req.uri().query()).or_else(|| token_from_headers(&req));
    let token = match token {
        Some(t) => t,
        None => return ApiError::Unauthorized.into_response(),
    };

    match resolve_token(&ctx, &token).await {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_covers_public_surfaces_only() {
        assert!(is_public("/api/health"));
        assert!(is_public("/"));
        assert!(is_public("/assets/app.js"));
        assert!(is_public("/favicon.ico"));
        assert!(is_public("/api/auth/pair"));
        assert!(!is_public("/api/sessions"));
        assert!(!is_public("/api/auth/devices"));
        assert!(!is_public("/api/playback/state"));
    }

    #[test]
    fn rate_limiter_enforces_the_window() {
        let mut limiter = ApiRateLimiter::new(3);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check_and_record(ip));
        assert!(limiter.check_and_record(ip));
        assert!(limiter.check_and_record(ip));
        assert!(!limiter.check_and_record(ip));
        // A different IP is tracked independently.
        assert!(limiter.check_and_record("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn query_token_extraction() {
        assert_eq!(
            token_from_query(Some("token=abc&x=1")),
            Some("abc".to_string())
        );
        assert_eq!(token_from_query(Some("x=1")), None);
        assert_eq!(token_from_query(Some("token=")), None);
        assert_eq!(token_from_query(None), None);
    }
}
