//! Round-trip tunneling over a loopback fake relay: a real host relay
//! client, a real tunnel client, and the real router in between.

use encored::{
    config::HostConfig,
    credentials::CredentialManager,
    devices::DeviceRegistry,
    events::EventBroadcaster,
    http::build_router,
    identity::IdentityStore,
    media::MediaBridge,
    pairing::PairingCoordinator,
    relay::{self, inject::RouterInjector},
    sessions::SessionManager,
    storage::Storage,
    tunnel::{TransportMode, TunnelClient, TunnelConfig, TunnelError, TunnelState},
    AppContext,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

// ─── Fake relay ──────────────────────────────────────────────────────────────

/// Minimal loopback relay: one host room, frame forwarding, no crypto
/// knowledge. `swallow_peer_frames` simulates a host that never answers.
#[derive(Default)]
struct FakeRelay {
    host: Mutex<Option<HostSlot>>,
    peers: Mutex<HashMap<String, mpsc::Sender<String>>>,
    swallow_peer_frames: AtomicBool,
}

struct HostSlot {
    tx: mpsc::Sender<String>,
    sealing_pubkey: String,
    server_name: String,
}

impl FakeRelay {
    async fn host_registered(&self) -> bool {
        self.host.lock().await.is_some()
    }
}

async fn spawn_fake_relay() -> (String, Arc<FakeRelay>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let relay = Arc::new(FakeRelay::default());

    let relay_accept = Arc::clone(&relay);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let relay = Arc::clone(&relay_accept);
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut stream) = ws.split();
                let (tx, mut rx) = mpsc::channel::<String>(64);
                tokio::spawn(async move {
                    while let Some(m) = rx.recv().await {
                        if sink.send(Message::Text(m)).await.is_err() {
                            break;
                        }
                    }
                });

                let mut is_host = false;
                let mut own_peer_id: Option<String> = None;

                while let Some(Ok(msg)) = stream.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(v) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    match v[0].as_str() {
                        Some("register") => {
                            is_host = true;
                            *relay.host.lock().await = Some(HostSlot {
                                tx: tx.clone(),
                                sealing_pubkey: v[1]["pubkey"].as_str().unwrap().to_string(),
                                server_name: v[1]["server_name"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string(),
                            });
                            let _ = tx.send(json!(["registered", {}]).to_string()).await;
                        }
                        Some("join") => {
                            let peer_id = v[1]["pubkey"].as_str().unwrap().to_string();
                            own_peer_id = Some(peer_id.clone());
                            relay.peers.lock().await.insert(peer_id.clone(), tx.clone());
                            if let Some(host) = &*relay.host.lock().await {
                                let _ = host
                                    .tx
                                    .send(
                                        json!(["peer_joined", {
                                            "peer_id": peer_id,
                                            "device_name": v[1]["device_name"],
                                        }])
                                        .to_string(),
                                    )
                                    .await;
                                let _ = tx
                                    .send(
                                        json!(["joined", {
                                            "host_pubkey": host.sealing_pubkey,
                                            "server_name": host.server_name,
                                        }])
                                        .to_string(),
                                    )
                                    .await;
                            }
                        }
                        Some("frame") => {
                            if is_host {
                                let peer_id = v[1].as_str().unwrap_or_default();
                                if let Some(peer_tx) = relay.peers.lock().await.get(peer_id) {
                                    let _ = peer_tx.send(text.clone()).await;
                                }
                            } else {
                                if relay.swallow_peer_frames.load(Ordering::SeqCst) {
                                    continue;
                                }
                                if let Some(host) = &*relay.host.lock().await {
                                    let _ = host.tx.send(text.clone()).await;
                                }
                            }
                        }
                        _ => {}
                    }
                }

                // Connection closed: tell the host its peer left.
                if let Some(peer_id) = own_peer_id {
                    relay.peers.lock().await.remove(&peer_id);
                    if let Some(host) = &*relay.host.lock().await {
                        let _ = host
                            .tx
                            .send(json!(["peer_left", { "peer_id": peer_id }]).to_string())
                            .await;
                    }
                }
            });
        }
    });

    (url, relay)
}

// ─── Host fixture ────────────────────────────────────────────────────────────

async fn start_host(
    dir: &TempDir,
    relay_url: &str,
) -> (Arc<AppContext>, watch::Sender<bool>, String) {
    let data_dir = dir.path().to_path_buf();
    let config = Arc::new(HostConfig::new(
        Some(0),
        Some("127.0.0.1".to_string()),
        Some(data_dir.clone()),
        Some("error".to_string()),
        Some(relay_url.to_string()),
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
        shutdown_rx.clone(),
    ));
    let ctx = Arc::new(AppContext {
        rate_limiter: AppContext::new_rate_limiter(1000),
        internal_marker: AppContext::generate_marker(),
        config: Arc::clone(&config),
        identity: Arc::clone(&identity),
        credentials: Arc::clone(&credentials),
        devices,
        pairing,
        sessions,
        broadcaster: Arc::clone(&broadcaster),
        media: MediaBridge::default(),
        started_at: std::time::Instant::now(),
    });

    let router = build_router(Arc::clone(&ctx));
    let injector = Arc::new(RouterInjector::new(
        router,
        ctx.internal_marker.clone(),
    ));
    relay::spawn(
        relay::RelayDeps {
            identity: Arc::clone(&identity),
            injector,
            token_source: credentials as _,
            broadcaster,
            playback: None,
            relay_url: relay_url.to_string(),
            local_url: "http://127.0.0.1:5720".to_string(),
            room_password_hash: None,
        },
        shutdown_rx,
    );

    let room_id = identity.get_relay_room_id().await;
    (ctx, shutdown_tx, room_id)
}

fn tunnel_config(relay_url: &str, room_id: &str, mode: TransportMode) -> TunnelConfig {
    TunnelConfig {
        relay_url: relay_url.to_string(),
        room_id: room_id.to_string(),
        device_name: "Test phone".to_string(),
        user_agent: "encore-test/1".to_string(),
        mode,
    }
}

async fn wait_connected(client: &TunnelClient) {
    let mut state = client.state_watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state.borrow() == TunnelState::Connected {
                return;
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("tunnel did not connect in time");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tunneled_get_round_trips_through_the_router() {
    let (relay_url, fake) = spawn_fake_relay().await;
    let dir = TempDir::new().unwrap();
    let (_ctx, _shutdown, room_id) = start_host(&dir, &relay_url).await;

    while !fake.host_registered().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = TunnelClient::new(tunnel_config(&relay_url, &room_id, TransportMode::Auto));
    client.start();
    wait_connected(&client).await;

    let resp = client
        .api_request("/api/health", "GET", None)
        .await
        .unwrap()
        .expect("connected tunnel must not fall back");
    assert!(resp.ok);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.data["status"], "ok");

    // The welcome frame carried the host's auth token and name.
    let welcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(w) = client.welcome().await {
                return w;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!welcome.auth_token.is_empty());
}

#[tokio::test]
async fn concurrent_requests_resolve_independently() {
    let (relay_url, fake) = spawn_fake_relay().await;
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown, room_id) = start_host(&dir, &relay_url).await;

    while !fake.host_registered().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = TunnelClient::new(tunnel_config(&relay_url, &room_id, TransportMode::Auto));
    client.start();
    wait_connected(&client).await;

    // Two in-flight requests with distinct correlation ids; each must get
    // its own response (injected requests are relay-authenticated, so the
    // protected /api/server route works without a token).
    let (health, server) = tokio::join!(
        client.api_request("/api/health", "GET", None),
        client.api_request("/api/server", "GET", None),
    );
    let health = health.unwrap().unwrap();
    let server = server.unwrap().unwrap();

    assert_eq!(health.status, 200);
    assert_eq!(health.data["status"], "ok");
    assert_eq!(server.status, 200);
    assert_eq!(
        server.data["serverId"].as_str().unwrap(),
        ctx.identity.server_id().await
    );
}

#[tokio::test]
async fn tunneled_errors_come_back_as_responses() {
    let (relay_url, fake) = spawn_fake_relay().await;
    let dir = TempDir::new().unwrap();
    let (_ctx, _shutdown, room_id) = start_host(&dir, &relay_url).await;

    while !fake.host_registered().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = TunnelClient::new(tunnel_config(&relay_url, &room_id, TransportMode::Auto));
    client.start();
    wait_connected(&client).await;

    let resp = client
        .api_request("/api/does-not-exist", "GET", None)
        .await
        .unwrap()
        .unwrap();
    assert!(!resp.ok);
    assert_eq!(resp.status, 404);
}

#[tokio::test]
async fn correlator_times_out_when_no_response_arrives() {
    let (relay_url, fake) = spawn_fake_relay().await;
    let dir = TempDir::new().unwrap();
    let (_ctx, _shutdown, room_id) = start_host(&dir, &relay_url).await;

    while !fake.host_registered().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = TunnelClient::new(tunnel_config(&relay_url, &room_id, TransportMode::Auto))
        .with_request_timeout(Duration::from_millis(300));
    client.start();
    wait_connected(&client).await;

    // The relay eats peer frames: the host never sees the request.
    fake.swallow_peer_frames.store(true, Ordering::SeqCst);
    let result = client.api_request("/api/health", "GET", None).await;
    assert_eq!(result, Err(TunnelError::Timeout));

    // No stale correlation remains — the next request resolves normally.
    fake.swallow_peer_frames.store(false, Ordering::SeqCst);
    let resp = client
        .api_request("/api/health", "GET", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn tunneled_post_carries_its_json_body() {
    let (relay_url, fake) = spawn_fake_relay().await;
    let dir = TempDir::new().unwrap();
    let (ctx, _shutdown, room_id) = start_host(&dir, &relay_url).await;

    while !fake.host_registered().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = TunnelClient::new(tunnel_config(&relay_url, &room_id, TransportMode::Auto));
    client.start();
    wait_connected(&client).await;

    // Pair a device entirely through the tunnel.
    let code = ctx.pairing.current_code().await.code;
    let resp = client
        .api_request(
            "/api/auth/pair",
            "POST",
            Some(json!({ "code": code, "deviceName": "Tunneled phone" })),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(resp.ok, "pair over tunnel failed: {:?}", resp.data);
    assert_eq!(resp.data["success"], true);
    assert!(resp.data["deviceToken"].is_string());
}
