//! Auth-hook behavior: allow-list, token extraction, marker safety.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::Utc;
use encored::{
    config::HostConfig,
    credentials::CredentialManager,
    devices::DeviceRegistry,
    events::EventBroadcaster,
    http::build_router,
    identity::IdentityStore,
    media::MediaBridge,
    pairing::PairingCoordinator,
    sessions::SessionManager,
    storage::Storage,
    AppContext,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

async fn make_test_ctx(dir: &TempDir) -> (Arc<AppContext>, watch::Sender<bool>) {
    let data_dir = dir.path().to_path_buf();
    let config = Arc::new(HostConfig::new(
        Some(0),
        Some("127.0.0.1".to_string()),
        Some(data_dir.clone()),
        Some("error".to_string()),
        None,
    ));
    let identity = Arc::new(IdentityStore::load_or_create(&data_dir).unwrap());
    let credentials = Arc::new(CredentialManager::load_or_create(&data_dir).unwrap());
    let storage = Storage::in_memory().await.unwrap();
    let devices = Arc::new(DeviceRegistry::new(storage.pool()));
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60)));
    let broadcaster = Arc::new(EventBroadcaster::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pairing = Arc::new(PairingCoordinator::new(
        Arc::clone(&devices),
        Arc::clone(&broadcaster),
        "http://127.0.0.1:5720".to_string(),
        identity.get_relay_room_id().await,
        false,
        shutdown_rx,
    ));
    let ctx = Arc::new(AppContext {
        rate_limiter: AppContext::new_rate_limiter(1000),
        internal_marker: AppContext::generate_marker(),
        config,
        identity,
        credentials,
        devices,
        pairing,
        sessions,
        broadcaster,
        media: MediaBridge::default(),
        started_at: std::time::Instant::now(),
    });
    (ctx, shutdown_tx)
}

async fn send(ctx: &Arc<AppContext>, request: Request<Body>) -> (StatusCode, Value) {
    let router = build_router(Arc::clone(ctx));
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_is_public_and_reports_sessions() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;

    let (status, body) = send(
        &ctx,
        Request::get("/api/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeSessions"], 0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn protected_routes_need_a_token() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;

    for path in ["/api/sessions", "/api/auth/devices", "/api/server"] {
        let (status, body) = send(&ctx, Request::get(path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{path}");
        assert_eq!(body["error"], "unauthorized");
    }
}

#[tokio::test]
async fn token_works_via_query_and_bearer() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;
    let access = ctx.credentials.access_token().await;

    let (status, _) = send(
        &ctx,
        Request::get(format!("/api/sessions?token={access}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &ctx,
        Request::get("/api/sessions")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn forged_marker_header_grants_nothing() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;

    // An attacker guessing the header name still lacks the process secret.
    let (status, _) = send(
        &ctx,
        Request::get("/api/sessions")
            .header("x-encore-internal", "0000000000000000")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn real_marker_authorizes_injected_requests() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;

    let (status, body) = send(
        &ctx,
        Request::get("/api/sessions")
            .header("x-encore-internal", ctx.internal_marker.clone())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["sessions"].is_array());
}

#[tokio::test]
async fn expired_device_token_gets_a_distinct_401() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;

    let past = Utc::now().timestamp() - 60;
    let (_, combined, _) = ctx
        .devices
        .register("Old phone", "ua", Some(past))
        .await
        .unwrap();

    let (status, body) = send(
        &ctx,
        Request::post("/api/auth/device")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "deviceToken": combined }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "expired");
}

#[tokio::test]
async fn unknown_api_routes_are_json_404s() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;
    let access = ctx.credentials.access_token().await;

    let (status, body) = send(
        &ctx,
        Request::get(format!("/api/does-not-exist?token={access}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn playback_surface_503s_when_not_wired() {
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown) = make_test_ctx(&dir).await;
    let access = ctx.credentials.access_token().await;

    let (status, body) = send(
        &ctx,
        Request::get(format!("/api/playback/state?token={access}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "upstream_unavailable");
    assert!(body["message"].as_str().unwrap().contains("playback"));
}
