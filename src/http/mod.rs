//! The front door — every external endpoint, the auth hook, rate limiting,
//! the WebSocket upgrade, and the SPA fallback.
//!
//! The router built here is also the injection target for relay-tunneled
//! requests: the relay client drives it in-process through
//! `tower::ServiceExt::oneshot`, so tunneled calls run the full handler
//! chain (auth hook included) without touching the network.

pub mod auth;
pub mod error;
pub mod routes;
pub mod spa;
pub mod ws;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::AppContext;

/// How many successive ports to try before giving up on startup.
const PORT_BIND_ATTEMPTS: u16 = 10;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Health (public)
        .route("/api/health", get(routes::health::health))
        // Auth & pairing
        .route("/api/auth/pair", post(routes::auth::pair))
        .route("/api/auth/pair/check", get(routes::auth::pair_check))
        .route("/api/auth/login", post(routes::auth::login))
        .route("/api/auth/device", post(routes::auth::device_check))
        .route("/api/auth/refresh", post(routes::auth::refresh))
        .route("/api/auth/logout", post(routes::auth::logout))
        .route("/api/auth/devices", get(routes::auth::list_devices))
        .route(
            "/api/auth/devices/{device_id}",
            delete(routes::auth::revoke_device),
        )
        .route("/api/auth/passphrase", get(routes::auth::get_passphrase))
        .route(
            "/api/auth/passphrase/regenerate",
            post(routes::auth::regenerate_passphrase),
        )
        .route("/api/auth/password", post(routes::auth::set_password))
        .route(
            "/api/auth/settings",
            get(routes::auth::get_settings).post(routes::auth::update_settings),
        )
        .route("/api/auth/pairing/code", get(routes::auth::pairing_code))
        .route(
            "/api/auth/pairing/code/refresh",
            post(routes::auth::refresh_pairing_code),
        )
        .route(
            "/api/auth/pairing/requests",
            get(routes::auth::pending_approvals),
        )
        .route(
            "/api/auth/pairing/requests/{id}/approve",
            post(routes::auth::approve_request),
        )
        .route(
            "/api/auth/pairing/requests/{id}/deny",
            post(routes::auth::deny_request),
        )
        // Legacy access token
        .route("/api/access/rotate", post(routes::access::rotate))
        .route("/api/access/info", get(routes::access::info))
        // Sessions
        .route("/api/sessions", get(routes::sessions::list))
        .route("/api/sessions/{id}", delete(routes::sessions::end))
        // Server identity
        .route("/api/server", get(routes::server::info))
        .route("/api/server/name", post(routes::server::rename))
        // Tunneled-compatible media surface
        .route("/api/playback/state", get(routes::playback::state))
        .route("/api/playback/command", post(routes::playback::command))
        .route("/api/search", get(routes::playback::search))
        .route("/api/library/tracks", get(routes::playback::library_tracks))
        // Live clients
        .route("/ws", get(ws::upgrade))
        // SPA static fallback
        .fallback(spa::fallback)
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            auth::auth_hook,
        ))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Bind `bind:port`, walking up to [`PORT_BIND_ATTEMPTS`] successive ports
/// when the requested one is taken. Returns the listener and the bound port.
pub async fn bind_with_retry(bind: &str, port: u16) -> Result<(TcpListener, u16)> {
    for attempt in 0..PORT_BIND_ATTEMPTS {
        let candidate = port.wrapping_add(attempt);
        let addr = format!("{bind}:{candidate}");
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                if attempt > 0 {
                    warn!(requested = port, bound = candidate, "port was taken — bound fallback");
                }
                return Ok((listener, candidate));
            }
            Err(e) => {
                warn!(addr = %addr, err = %e, "bind failed");
            }
        }
    }
    anyhow::bail!(
        "could not bind any of {} ports starting at {bind}:{port}",
        PORT_BIND_ATTEMPTS
    )
}

/// Serve until the shutdown signal flips. The listener closes last so
/// in-flight requests drain first.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local addr")?;
    info!(addr = %addr, "front door listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(crate::shutdown::triggered(shutdown))
    .await
    .context("front door server error")
}
