//! Outbound relay client — registers the host's room on the relay server so
//! remote Encore clients can reach the desktop over the internet.
//!
//! Protocol:
//! 1. Connect to the configured relay URL (default `wss://relay.encore.fm/ws`)
//! 2. Send `["register", {room_id, server_name, pubkey, signing_key, sig}]`
//!    — the registration is signed with the identity key; await `registered`
//! 3. On `peer_joined`: derive a sealing channel from the peer's ephemeral
//!    key and send a `welcome` frame carrying the active auth token and
//!    local URL
//! 4. Demux sealed inbound frames: `api-request` is injected into the local
//!    router and answered with `api-response`; `playback-command` is
//!    dispatched to the playback orchestrator and answered with `command-ack`
//! 5. Forward daemon push events to every connected peer (sealed)
//! 6. On disconnect: reconnect with exponential backoff (1s → ×1.5 → cap
//!    30s, max 10 attempts); every reconnect re-registers the same room_id.
//!    Exhausting the attempts stops remote access but leaves local serving
//!    untouched.

pub mod crypto;
pub mod inject;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::events::{EventBroadcaster, HostEvent, RelayState};
use crate::identity::IdentityStore;
use crate::media::Playback;

use crypto::{encode_pubkey, PeerCrypto};
use inject::{AuthTokenSource, RequestInjector};
use protocol::{PeerFrame, RelayEvent};

/// Reconnect backoff: initial delay, multiplier, cap, attempt budget.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 10;

/// Cap on concurrently running injections.
const MAX_IN_FLIGHT_INJECTIONS: usize = 64;

/// Outbound channel depth — a hard bound on queued frames.
const OUTBOUND_DEPTH: usize = 64;

/// Keepalive ping period.
const PING_PERIOD: Duration = Duration::from_secs(15);

/// Everything the relay client needs from the rest of the daemon.
pub struct RelayDeps {
    pub identity: Arc<IdentityStore>,
    pub injector: Arc<dyn RequestInjector>,
    pub token_source: Arc<dyn AuthTokenSource>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub playback: Option<Arc<dyn Playback>>,
    pub relay_url: String,
    pub local_url: String,
    pub room_password_hash: Option<String>,
}

/// Starts the relay background task. Returns its join handle; the task exits
/// on shutdown or after the reconnect budget is exhausted.
pub fn spawn(deps: RelayDeps, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(relay_loop(Arc::new(deps), shutdown))
}

// ─── Background loop ──────────────────────────────────────────────────────────

async fn relay_loop(deps: Arc<RelayDeps>, mut shutdown: watch::Receiver<bool>) {
    let mut attempts: u32 = 0;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if *shutdown.borrow() {
            break;
        }
        info!(url = %deps.relay_url, "relay: connecting");

        let connect = tokio::select! {
            c = connect_async(&deps.relay_url) => c,
            _ = shutdown.changed() => break,
        };

        match connect {
            Ok((ws_stream, _)) => {
                info!("relay: connected");
                attempts = 0;
                backoff = BACKOFF_INITIAL;

                match run_connection(&deps, ws_stream, &mut shutdown).await {
                    ConnectionEnd::Shutdown => break,
                    ConnectionEnd::Fatal(reason) => {
                        warn!(reason = %reason, "relay: fatal — stopping remote access");
                        deps.broadcaster.broadcast(HostEvent::RelayStatus {
                            state: RelayState::Failed,
                            reason: Some(reason),
                        });
                        return;
                    }
                    ConnectionEnd::Dropped => {
                        warn!("relay: connection dropped");
                    }
                }
            }
            Err(e) => {
                warn!("relay: connection failed: {e:#}");
            }
        }

        attempts += 1;
        if attempts >= MAX_ATTEMPTS {
            warn!(attempts, "relay: reconnect attempts exhausted — remote access stopped");
            deps.broadcaster.broadcast(HostEvent::RelayStatus {
                state: RelayState::Failed,
                reason: Some("max reconnect attempts".to_string()),
            });
            return;
        }

        info!("relay: reconnecting in {:.1}s", backoff.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = Duration::from_secs_f64(
            (backoff.as_secs_f64() * BACKOFF_MULTIPLIER).min(BACKOFF_CAP.as_secs_f64()),
        );
    }

    debug!("relay: stopped");
}

enum ConnectionEnd {
    /// Socket died; caller reconnects.
    Dropped,
    /// Unrecoverable (relay rejected our registration).
    Fatal(String),
    Shutdown,
}

async fn run_connection(
    deps: &Arc<RelayDeps>,
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws_stream.split();

    // Signed registration: the relay can verify room ownership, and the
    // room id is preserved across reconnects by construction.
    let room_id = deps.identity.get_relay_room_id().await;
    let server_name = deps.identity.server_name().await;
    let sealing_pub = encode_pubkey(&x25519_dalek::PublicKey::from(
        &deps.identity.sealing_key().await,
    ));
    let signing_pub = deps.identity.get_public_identity().await.public_key;
    let sig = deps
        .identity
        .sign(format!("{room_id}:{sealing_pub}").as_bytes())
        .await;
    let register = protocol::register_frame(
        &room_id,
        &server_name,
        &sealing_pub,
        &signing_pub,
        &sig,
        deps.room_password_hash.as_deref(),
    );
    if let Err(e) = sink.send(Message::Text(register)).await {
        warn!("relay: failed to send register: {e:#}");
        return ConnectionEnd::Dropped;
    }

    // Connection-scoped state: peer channels and the single-writer outbound
    // queue. Request/response frames use `send` (hard backpressure);
    // keepalive pings use `try_send` and may be dropped on overflow.
    let peers: Arc<Mutex<HashMap<String, Arc<PeerCrypto>>>> = Arc::new(Mutex::new(HashMap::new()));
    let injections = Arc::new(Semaphore::new(MAX_IN_FLIGHT_INJECTIONS));
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_DEPTH);

    let mut broadcast_rx = deps.broadcaster.subscribe();
    let mut ping_timer = tokio::time::interval(PING_PERIOD);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Inbound relay traffic
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                    Some(Err(e)) => {
                        warn!("relay: socket error: {e:#}");
                        return ConnectionEnd::Dropped;
                    }
                    _ => continue,
                };
                match protocol::parse_event(&text) {
                    Some(event) => {
                        if let Some(end) = handle_event(deps, event, &peers, &injections, &out_tx).await {
                            return end;
                        }
                    }
                    None => debug!("relay: dropping unparseable frame"),
                }
            }

            // Outbound queue → socket (single writer)
            out = out_rx.recv() => {
                match out {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            warn!("relay: send failed: {e:#}");
                            return ConnectionEnd::Dropped;
                        }
                    }
                    None => return ConnectionEnd::Dropped,
                }
            }

            // Daemon push events → every peer, sealed
            event = broadcast_rx.recv() => {
                match event {
                    Ok(json) => {
                        let peers_snapshot: Vec<(String, Arc<PeerCrypto>)> = peers
                            .lock()
                            .await
                            .iter()
                            .map(|(id, c)| (id.clone(), Arc::clone(c)))
                            .collect();
                        for (peer_id, channel) in peers_snapshot {
                            match channel.seal(&json) {
                                Ok(sealed) => {
                                    if out_tx.send(protocol::data_frame(&peer_id, &sealed)).await.is_err() {
                                        return ConnectionEnd::Dropped;
                                    }
                                }
                                Err(e) => warn!(peer = %peer_id, "relay: event seal failed: {e:#}"),
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return ConnectionEnd::Dropped,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "relay: broadcast lagged");
                    }
                }
            }

            // Keepalive — dropped on overflow rather than blocking the loop.
            _ = ping_timer.tick() => {
                let _ = out_tx.try_send(protocol::ping_frame());
            }

            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return ConnectionEnd::Shutdown;
            }
        }
    }
}

/// Handle one parsed relay event. Returns `Some(end)` when the connection
/// must stop.
async fn handle_event(
    deps: &Arc<RelayDeps>,
    event: RelayEvent,
    peers: &Arc<Mutex<HashMap<String, Arc<PeerCrypto>>>>,
    injections: &Arc<Semaphore>,
    out_tx: &mpsc::Sender<String>,
) -> Option<ConnectionEnd> {
    match event {
        RelayEvent::Registered => {
            info!("relay: room registered");
            deps.broadcaster.broadcast(HostEvent::RelayStatus {
                state: RelayState::Connected,
                reason: None,
            });
            None
        }

        RelayEvent::PeerJoined { peer_id, device_name } => {
            debug!(peer = %peer_id, device = %device_name, "relay: peer joined");
            let channel = match PeerCrypto::host_side(&deps.identity.sealing_key().await, &peer_id)
            {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    warn!(peer = %peer_id, "relay: bad peer key: {e:#}");
                    return None;
                }
            };
            peers.lock().await.insert(peer_id.clone(), Arc::clone(&channel));

            // Welcome the peer with everything it needs to tunnel
            // authenticated requests.
            let welcome = PeerFrame::Welcome {
                auth_token: deps.token_source.active_token().await,
                local_url: deps.local_url.clone(),
                server_name: deps.identity.server_name().await,
            };
            match seal_frame(&channel, &welcome) {
                Ok(sealed) => {
                    if out_tx.send(protocol::data_frame(&peer_id, &sealed)).await.is_err() {
                        return Some(ConnectionEnd::Dropped);
                    }
                }
                Err(e) => warn!(peer = %peer_id, "relay: welcome seal failed: {e:#}"),
            }
            None
        }

        RelayEvent::PeerLeft { peer_id } => {
            debug!(peer = %peer_id, "relay: peer left");
            peers.lock().await.remove(&peer_id);
            None
        }

        RelayEvent::Frame { peer_id, sealed } => {
            let channel = match peers.lock().await.get(&peer_id) {
                Some(c) => Arc::clone(c),
                None => {
                    debug!(peer = %peer_id, "relay: frame from unknown peer dropped");
                    return None;
                }
            };
            // Decryption failure drops the frame silently.
            let inner = match channel.open(&sealed) {
                Ok(s) => s,
                Err(e) => {
                    debug!(peer = %peer_id, "relay: frame failed to open: {e:#}");
                    return None;
                }
            };
            let frame: PeerFrame = match serde_json::from_str(&inner) {
                Ok(f) => f,
                Err(_) => {
                    debug!(peer = %peer_id, "relay: undecodable peer frame dropped");
                    return None;
                }
            };
            dispatch_peer_frame(deps, frame, peer_id, channel, injections, out_tx).await;
            None
        }

        RelayEvent::Error { code, message } => {
            // Registration rejection is fatal; everything else is transient.
            if code.as_deref() == Some("auth") || code.as_deref() == Some("register") {
                return Some(ConnectionEnd::Fatal(message));
            }
            warn!(message = %message, "relay: server error");
            None
        }

        // Host side never joins rooms; these are peer-directed.
        RelayEvent::Joined { .. } | RelayEvent::AuthRequired => None,
    }
}

/// Dispatch a decoded peer frame. Injections run as bounded concurrent
/// tasks so a slow handler cannot stall the socket loop.
async fn dispatch_peer_frame(
    deps: &Arc<RelayDeps>,
    frame: PeerFrame,
    peer_id: String,
    channel: Arc<PeerCrypto>,
    injections: &Arc<Semaphore>,
    out_tx: &mpsc::Sender<String>,
) {
    match frame {
        PeerFrame::ApiRequest {
            request_id,
            method,
            url,
            body,
            auth_token: _,
        } => {
            let permit = match Arc::clone(injections).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    // Over the in-flight cap: answer 503 instead of queueing.
                    let resp = PeerFrame::ApiResponse {
                        request_id,
                        ok: false,
                        status: 503,
                        data: serde_json::json!({ "error": "too-many-in-flight" }),
                    };
                    send_sealed(&channel, &peer_id, &resp, out_tx).await;
                    return;
                }
            };

            let injector = Arc::clone(&deps.injector);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = injector.inject(&method, &url, body.as_ref()).await;
                let resp = PeerFrame::ApiResponse {
                    request_id,
                    ok: result.ok,
                    status: result.status,
                    data: result.data,
                };
                send_sealed(&channel, &peer_id, &resp, &out_tx).await;
            });
        }

        PeerFrame::PlaybackCommand { request_id, command } => {
            let ack = match &deps.playback {
                Some(playback) => match playback.command(command).await {
                    Ok(()) => PeerFrame::CommandAck {
                        request_id,
                        success: true,
                        error: None,
                    },
                    Err(e) => PeerFrame::CommandAck {
                        request_id,
                        success: false,
                        error: Some(e.to_string()),
                    },
                },
                None => PeerFrame::CommandAck {
                    request_id,
                    success: false,
                    error: Some("playback unavailable".to_string()),
                },
            };
            send_sealed(&channel, &peer_id, &ack, out_tx).await;
        }

        // Host-originated frame types arriving inbound are dropped.
        PeerFrame::Welcome { .. } | PeerFrame::ApiResponse { .. } | PeerFrame::CommandAck { .. } => {
            debug!(peer = %peer_id, "relay: unexpected peer frame dropped");
        }
    }
}

fn seal_frame(channel: &PeerCrypto, frame: &PeerFrame) -> anyhow::Result<String> {
    channel.seal(&serde_json::to_string(frame)?)
}

async fn send_sealed(
    channel: &PeerCrypto,
    peer_id: &str,
    frame: &PeerFrame,
    out_tx: &mpsc::Sender<String>,
) {
    match seal_frame(channel, frame) {
        Ok(sealed) => {
            if out_tx.send(protocol::data_frame(peer_id, &sealed)).await.is_err() {
                debug!(peer = %peer_id, "relay: outbound queue closed");
            }
        }
        Err(e) => warn!(peer = %peer_id, "relay: seal failed: {e:#}"),
    }
}
