//! WebSocket endpoint for live clients (`/ws?token=…`).
//!
//! Auth runs the same token logic as HTTP. A failed upgrade is accepted and
//! immediately closed with code 4001 so clients can distinguish auth failure
//! from network failure. Every authenticated socket gets a Session, one
//! initial `session-update` frame, and the broadcast fan-out.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::HostEvent;
use crate::http::auth::resolve_token;
use crate::AppContext;

/// Close code for authentication failure.
const CLOSE_UNAUTHORIZED: u16 = 4001;

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn upgrade(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, query.token, user_agent))
}

async fn handle_socket(
    socket: WebSocket,
    ctx: Arc<AppContext>,
    token: Option<String>,
    user_agent: String,
) {
    let (mut sink, mut stream) = socket.split();

    let principal = match token {
        Some(t) => resolve_token(&ctx, &t).await.ok(),
        None => None,
    };
    let Some(principal) = principal else {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "authentication failed".into(),
            })))
            .await;
        return;
    };

    let session = ctx
        .sessions
        .create(principal.owner_token(), &user_agent)
        .await;
    debug!(session = %session.id, "websocket session opened");

    // Initial state push so the client can render immediately.
    let hello = HostEvent::SessionUpdate {
        session_id: session.id.clone(),
        active_sessions: ctx.sessions.active_count().await,
    };
    if sink.send(Message::Text(hello.frame().into())).await.is_err() {
        ctx.sessions.end(&session.id).await;
        return;
    }

    let mut broadcast_rx = ctx.broadcaster.subscribe();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // A session removed by the sweeper or bulk
                        // invalidation cannot be renewed — drop the socket.
                        if !ctx.sessions.update_activity(&session.id).await {
                            let _ = sink.send(Message::Close(Some(CloseFrame {
                                code: CLOSE_UNAUTHORIZED,
                                reason: "session ended".into(),
                            }))).await;
                            return;
                        }
                        if let Some(reply) = handle_frame(&ctx, text.as_str()).await {
                            if sink.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(frame) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Slow client skipped events; keep the socket alive.
                        warn!(skipped = n, "ws broadcast lagged");
                    }
                }
            }
        }
    }

    ctx.sessions.end(&session.id).await;
    debug!(session = %session.id, "websocket session closed");
}

/// Handle one inbound `{type, payload?}` frame. Returns the serialized reply
/// frame, if the type calls for a direct reply.
async fn handle_frame(ctx: &AppContext, text: &str) -> Option<String> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return None, // malformed frames are dropped silently
    };

    match frame["type"].as_str().unwrap_or_default() {
        "ping" => Some(json!({ "type": "pong" }).to_string()),

        // The desktop shell pushes its playback state; fan it out to every
        // connected client as `desktop-state`.
        "playback-sync" => {
            ctx.broadcaster
                .broadcast(HostEvent::DesktopState(frame["payload"].clone()));
            None
        }

        "remote-command" => {
            let playback = ctx.media.playback.as_ref()?;
            match serde_json::from_value(frame["payload"].clone()) {
                Ok(command) => {
                    if let Err(e) = playback.command(command).await {
                        warn!(err = %e, "remote command failed");
                    }
                }
                Err(e) => debug!(err = %e, "unparseable remote command"),
            }
            None
        }

        "request-desktop-state" => {
            let playback = ctx.media.playback.as_ref()?;
            match playback.state().await {
                Ok(state) => Some(
                    HostEvent::DesktopState(serde_json::to_value(state).unwrap_or_default())
                        .frame(),
                ),
                Err(e) => {
                    warn!(err = %e, "desktop state query failed");
                    None
                }
            }
        }

        other => {
            debug!(frame_type = %other, "unrecognized ws frame");
            None
        }
    }
}
