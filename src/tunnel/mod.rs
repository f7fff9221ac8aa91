//! Tunnel client — the mobile app's transport to a remote host.
//!
//! Owns one outbound relay socket, joins the host's room with an ephemeral
//! key, seals every frame after the handshake, and correlates `api-request`
//! / `api-response` pairs so callers see an ordinary request/response API:
//!
//! ```ignore
//! let client = TunnelClient::new(config);
//! client.start();
//! let resp = client.api_request("/api/health", "GET", None).await?;
//! ```
//!
//! State machine: `disconnected → connecting → {connected |
//! requires_password | error} → disconnected`. `requires_password` is
//! entered when the relay demands a room password; the caller collects one,
//! hashes it via [`crate::relay::crypto::hash_room_password`], and
//! [`TunnelClient::supply_password`] re-joins. Reconnects use the same
//! backoff as the host (1s × 1.5 → 30s, max 10 attempts); a visibility
//! change resets the attempt budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rand_core::OsRng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock, Semaphore};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::relay::crypto::{encode_pubkey, hash_room_password, PeerCrypto};
use crate::relay::protocol::{self, PeerFrame, RelayEvent};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 10;

/// Correlator deadline for a tunneled request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Cap on concurrent in-flight tunneled requests.
const MAX_IN_FLIGHT: usize = 64;
/// Keepalive ping period while the socket is open.
const PING_PERIOD: Duration = Duration::from_secs(15);

const REQUEST_ID_LEN: usize = 12;

// ─── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    RequiresPassword,
    Error(String),
}

/// Whether the caller may fall back to direct HTTP when the tunnel is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// LAN app: a down tunnel yields `None` so the caller tries direct HTTP.
    Auto,
    /// Static-hosted web app: the relay is the only transport; a down tunnel
    /// yields a synthetic 503.
    RelayOnly,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub relay_url: String,
    pub room_id: String,
    pub device_name: String,
    pub user_agent: String,
    pub mode: TransportMode,
}

/// A tunneled response, shaped like the host's `api-response` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub ok: bool,
    pub status: u16,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    /// No matching `api-response` arrived within the deadline.
    #[error("tunneled request timed out")]
    Timeout,
    /// The in-flight cap was hit; fail fast rather than queueing.
    #[error("too-many-in-flight")]
    TooManyInFlight,
    /// The client is shutting down; the correlation was abandoned.
    #[error("tunnel shut down")]
    Shutdown,
}

/// What the host sent in its `welcome` frame.
#[derive(Debug, Clone)]
pub struct WelcomeInfo {
    pub auth_token: String,
    pub local_url: String,
    pub server_name: String,
}

// ─── Internals ───────────────────────────────────────────────────────────────

/// Live-connection handle: the sealing channel, our peer id, and the
/// outbound queue feeding the single socket writer.
#[derive(Clone)]
struct ConnHandle {
    crypto: Arc<PeerCrypto>,
    peer_id: String,
    out_tx: mpsc::Sender<String>,
}

struct Shared {
    state_tx: watch::Sender<TunnelState>,
    conn: RwLock<Option<ConnHandle>>,
    welcome: RwLock<Option<WelcomeInfo>>,
    /// Pending request correlator — both resolve and expiry take this lock.
    pending: Mutex<HashMap<String, oneshot::Sender<ApiResponse>>>,
    in_flight: Semaphore,
    password_hash: RwLock<Option<String>>,
    attempts: AtomicU32,
    /// Pinged on visibility change or password supply to cut a backoff wait
    /// short.
    wake: Notify,
    shutdown_tx: watch::Sender<bool>,
}

pub struct TunnelClient {
    config: TunnelConfig,
    request_timeout: Duration,
    shared: Arc<Shared>,
}

impl TunnelClient {
    pub fn new(config: TunnelConfig) -> Self {
        let (state_tx, _) = watch::channel(TunnelState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            request_timeout: REQUEST_TIMEOUT,
            shared: Arc::new(Shared {
                state_tx,
                conn: RwLock::new(None),
                welcome: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                in_flight: Semaphore::new(MAX_IN_FLIGHT),
                password_hash: RwLock::new(None),
                attempts: AtomicU32::new(0),
                wake: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    /// Shrink the correlator deadline (tests only).
    #[doc(hidden)]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Start the connection loop. Idempotent per client instance.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        tokio::spawn(run_loop(shared, config))
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<TunnelState> {
        self.shared.state_tx.subscribe()
    }

    pub async fn welcome(&self) -> Option<WelcomeInfo> {
        self.shared.welcome.read().await.clone()
    }

    /// Hash and store a room password, then re-join.
    pub async fn supply_password(&self, password: &str) {
        *self.shared.password_hash.write().await = Some(hash_room_password(password));
        self.shared.attempts.store(0, Ordering::SeqCst);
        let _ = self.shared.state_tx.send(TunnelState::Connecting);
        self.shared.wake.notify_one();
    }

    /// Page became visible again: reset the attempt budget and reconnect
    /// immediately if we were previously connected.
    pub fn notify_visible(&self) {
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Stop the loop and reject outstanding correlations with `Shutdown`.
    pub async fn close(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.pending.lock().await.clear();
        let _ = self.shared.state_tx.send(TunnelState::Disconnected);
    }

    /// Tunnel an HTTP-style request to the host.
    ///
    /// Returns `Ok(None)` when disconnected in [`TransportMode::Auto`] — the
    /// caller may fall back to direct HTTP on the local network. In
    /// [`TransportMode::RelayOnly`] a down tunnel yields a synthetic 503.
    pub async fn api_request(
        &self,
        url: &str,
        method: &str,
        body: Option<Value>,
    ) -> Result<Option<ApiResponse>, TunnelError> {
        if *self.shared.shutdown_tx.borrow() {
            return Err(TunnelError::Shutdown);
        }
        let conn = self.shared.conn.read().await.clone();
        let Some(conn) = conn else {
            return Ok(self.disconnected_response());
        };

        let _permit = self
            .shared
            .in_flight
            .try_acquire()
            .map_err(|_| TunnelError::TooManyInFlight)?;

        let request_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REQUEST_ID_LEN)
            .map(char::from)
            .collect();

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let auth_token = self
            .shared
            .welcome
            .read()
            .await
            .as_ref()
            .map(|w| w.auth_token.clone());
        let frame = PeerFrame::ApiRequest {
            request_id: request_id.clone(),
            method: method.to_string(),
            url: url.to_string(),
            body,
            auth_token,
        };

        let sealed = match serde_json::to_string(&frame)
            .map_err(anyhow::Error::from)
            .and_then(|json| conn.crypto.seal(&json))
        {
            Ok(s) => s,
            Err(e) => {
                warn!("tunnel: seal failed: {e:#}");
                self.shared.pending.lock().await.remove(&request_id);
                return Ok(self.disconnected_response());
            }
        };

        // Request frames take hard backpressure — a full or closed queue is
        // an error, never a silent drop.
        if conn
            .out_tx
            .send(protocol::data_frame(&conn.peer_id, &sealed))
            .await
            .is_err()
        {
            self.shared.pending.lock().await.remove(&request_id);
            return Ok(self.disconnected_response());
        }

        let mut shutdown = self.shared.shutdown_tx.subscribe();
        tokio::select! {
            resolved = rx => match resolved {
                Ok(response) => Ok(Some(response)),
                // Sender dropped — the client was closed underneath us.
                Err(_) => Err(TunnelError::Shutdown),
            },
            _ = tokio::time::sleep(self.request_timeout) => {
                // Expire the correlation so no stale entry remains.
                self.shared.pending.lock().await.remove(&request_id);
                Err(TunnelError::Timeout)
            }
            _ = shutdown.changed() => {
                self.shared.pending.lock().await.remove(&request_id);
                Err(TunnelError::Shutdown)
            }
        }
    }

    fn disconnected_response(&self) -> Option<ApiResponse> {
        match self.config.mode {
            TransportMode::Auto => None,
            TransportMode::RelayOnly => Some(ApiResponse {
                ok: false,
                status: 503,
                data: json!({ "error": "relay-disconnected" }),
            }),
        }
    }
}

// ─── Connection loop ─────────────────────────────────────────────────────────

async fn run_loop(shared: Arc<Shared>, config: TunnelConfig) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let _ = shared.state_tx.send(TunnelState::Connecting);

        let connect = tokio::select! {
            c = connect_async(&config.relay_url) => c,
            _ = shutdown.changed() => break,
        };

        let end = match connect {
            Ok((ws_stream, _)) => {
                backoff = BACKOFF_INITIAL;
                run_connection(&shared, &config, ws_stream, &mut shutdown).await
            }
            Err(e) => {
                warn!("tunnel: connection failed: {e:#}");
                ConnectionEnd::Dropped
            }
        };

        // Connection state is per-socket.
        *shared.conn.write().await = None;

        match end {
            ConnectionEnd::Shutdown => break,
            ConnectionEnd::AuthRequired => {
                info!("tunnel: room requires a password");
                let _ = shared.state_tx.send(TunnelState::RequiresPassword);
                // Park until supply_password (or shutdown) wakes us.
                tokio::select! {
                    _ = shared.wake.notified() => continue,
                    _ = shutdown.changed() => break,
                }
            }
            ConnectionEnd::Dropped => {}
        }

        let attempts = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts >= MAX_ATTEMPTS {
            warn!(attempts, "tunnel: reconnect attempts exhausted");
            let _ = shared
                .state_tx
                .send(TunnelState::Error("max reconnect attempts".to_string()));
            // A visibility change resets the budget and resumes.
            tokio::select! {
                _ = shared.wake.notified() => {
                    backoff = BACKOFF_INITIAL;
                    continue;
                }
                _ = shutdown.changed() => break,
            }
        }

        let _ = shared.state_tx.send(TunnelState::Disconnected);
        debug!("tunnel: reconnecting in {:.1}s", backoff.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shared.wake.notified() => {}
            _ = shutdown.changed() => break,
        }
        backoff = Duration::from_secs_f64(
            (backoff.as_secs_f64() * BACKOFF_MULTIPLIER).min(BACKOFF_CAP.as_secs_f64()),
        );
    }

    let _ = shared.state_tx.send(TunnelState::Disconnected);
    debug!("tunnel: stopped");
}

enum ConnectionEnd {
    Dropped,
    AuthRequired,
    Shutdown,
}

async fn run_connection(
    shared: &Arc<Shared>,
    config: &TunnelConfig,
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws_stream.split();

    // Fresh ephemeral key per connection; consumed by the handshake.
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let peer_id = encode_pubkey(&PublicKey::from(&secret));
    let mut ephemeral = Some(secret);

    let password_hash = shared.password_hash.read().await.clone();
    let join = protocol::join_frame(
        &config.room_id,
        &peer_id,
        &config.device_name,
        &config.user_agent,
        password_hash.as_deref(),
    );
    if let Err(e) = sink.send(Message::Text(join)).await {
        warn!("tunnel: failed to send join: {e:#}");
        return ConnectionEnd::Dropped;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let mut crypto: Option<Arc<PeerCrypto>> = None;

    let mut ping_timer = tokio::time::interval(PING_PERIOD);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                    Some(Err(e)) => {
                        warn!("tunnel: socket error: {e:#}");
                        return ConnectionEnd::Dropped;
                    }
                    _ => continue,
                };
                match protocol::parse_event(&text) {
                    Some(RelayEvent::Joined { host_pubkey, server_name }) => {
                        let Some(secret) = ephemeral.take() else {
                            debug!("tunnel: duplicate joined event dropped");
                            continue;
                        };
                        match PeerCrypto::client_side(secret, &host_pubkey) {
                            Ok(channel) => {
                                let channel = Arc::new(channel);
                                crypto = Some(Arc::clone(&channel));
                                *shared.conn.write().await = Some(ConnHandle {
                                    crypto: channel,
                                    peer_id: peer_id.clone(),
                                    out_tx: out_tx.clone(),
                                });
                                shared.attempts.store(0, Ordering::SeqCst);
                                let _ = shared.state_tx.send(TunnelState::Connected);
                                info!(server = ?server_name, "tunnel: joined");
                            }
                            Err(e) => {
                                warn!("tunnel: bad host key: {e:#}");
                                return ConnectionEnd::Dropped;
                            }
                        }
                    }
                    Some(RelayEvent::AuthRequired) => return ConnectionEnd::AuthRequired,
                    Some(RelayEvent::Frame { sealed, .. }) => {
                        let Some(channel) = crypto.as_ref() else { continue };
                        // Decryption failure silently drops the frame.
                        let Ok(inner) = channel.open(&sealed) else {
                            debug!("tunnel: frame failed to open");
                            continue;
                        };
                        handle_peer_frame(shared, &inner).await;
                    }
                    Some(RelayEvent::Error { message, .. }) => {
                        warn!(message = %message, "tunnel: relay error");
                        return ConnectionEnd::Dropped;
                    }
                    // Host-directed notifications; nothing for a peer to do.
                    Some(_) => {}
                    None => debug!("tunnel: dropping unparseable frame"),
                }
            }

            out = out_rx.recv() => {
                match out {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            warn!("tunnel: send failed: {e:#}");
                            return ConnectionEnd::Dropped;
                        }
                    }
                    None => return ConnectionEnd::Dropped,
                }
            }

            // Lightweight keepalive; droppable on overflow.
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

/// Dispatch one opened peer frame from the host.
async fn handle_peer_frame(shared: &Arc<Shared>, inner: &str) {
    let frame: PeerFrame = match serde_json::from_str(inner) {
        Ok(f) => f,
        Err(_) => {
            debug!("tunnel: undecodable peer frame dropped");
            return;
        }
    };

    match frame {
        PeerFrame::Welcome {
            auth_token,
            local_url,
            server_name,
        } => {
            debug!(server = %server_name, "tunnel: welcomed");
            *shared.welcome.write().await = Some(WelcomeInfo {
                auth_token,
                local_url,
                server_name,
            });
        }

        PeerFrame::ApiResponse {
            request_id,
            ok,
            status,
            data,
        } => {
            // Unmatched responses are ignored.
            if let Some(tx) = shared.pending.lock().await.remove(&request_id) {
                let _ = tx.send(ApiResponse { ok, status, data });
            } else {
                debug!(request = %request_id, "tunnel: unmatched api-response dropped");
            }
        }

        PeerFrame::CommandAck { request_id, success, .. } => {
            debug!(request = %request_id, success, "tunnel: command ack");
        }

        // Peer-originated frame types arriving inbound are dropped.
        PeerFrame::ApiRequest { .. } | PeerFrame::PlaybackCommand { .. } => {
            debug!("tunnel: unexpected host frame dropped");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(mode: TransportMode) -> TunnelClient {
        TunnelClient::new(TunnelConfig {
            relay_url: "ws://127.0.0.1:1".to_string(),
            room_id: "room".to_string(),
            device_name: "Test".to_string(),
            user_agent: "test/1".to_string(),
            mode,
        })
    }

    #[tokio::test]
    async fn disconnected_auto_mode_returns_none_for_local_fallback() {
        let client = test_client(TransportMode::Auto);
        let resp = client.api_request("/api/health", "GET", None).await.unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn disconnected_relay_only_mode_returns_synthetic_503() {
        let client = test_client(TransportMode::RelayOnly);
        let resp = client
            .api_request("/api/health", "GET", None)
            .await
            .unwrap()
            .unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.status, 503);
        assert_eq!(resp.data["error"], "relay-disconnected");
    }

    #[tokio::test]
    async fn unmatched_responses_are_ignored() {
        let client = test_client(TransportMode::Auto);
        let frame = serde_json::to_string(&PeerFrame::ApiResponse {
            request_id: "nobody-waiting".to_string(),
            ok: true,
            status: 200,
            data: json!({}),
        })
        .unwrap();
        // Must not panic or leave state behind.
        handle_peer_frame(&client.shared, &frame).await;
        assert!(client.shared.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn welcome_is_stored_for_later_requests() {
        let client = test_client(TransportMode::Auto);
        let frame = serde_json::to_string(&PeerFrame::Welcome {
            auth_token: "tok".to_string(),
            local_url: "http://10.0.0.2:5720".to_string(),
            server_name: "Studio".to_string(),
        })
        .unwrap();
        handle_peer_frame(&client.shared, &frame).await;
        let welcome = client.welcome().await.unwrap();
        assert_eq!(welcome.auth_token, "tok");
        assert_eq!(welcome.server_name, "Studio");
    }

    #[tokio::test]
    async fn supply_password_moves_state_to_connecting() {
        let client = test_client(TransportMode::Auto);
        client.supply_password("secret").await;
        assert_eq!(client.state(), TunnelState::Connecting);
        assert!(client.shared.password_hash.read().await.is_some());
    }
}
