//! Relay wire protocol.
//!
//! Control traffic is clear JSON arrays `[<type>, …]` the relay itself
//! understands: `register` / `join` / `ping` from endpoints, and
//! `registered` / `peer_joined` / `peer_left` / `joined` / `auth-required` /
//! `error` notifications back. Data frames are `["frame", <peer_id>,
//! <sealed>]` where the payload is opaque ciphertext the relay forwards
//! without inspection; `peer_id` always names the non-host endpoint.
//!
//! Sealed payloads decode to [`PeerFrame`] — the end-to-end messages the
//! host and a peer exchange.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::media::PlaybackCommand;

// ─── Sealed peer frames ──────────────────────────────────────────────────────

/// End-to-end messages carried inside sealed data frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerFrame {
    /// Host → peer, right after `peer_joined`: everything the peer needs to
    /// tunnel authenticated requests.
    Welcome {
        auth_token: String,
        local_url: String,
        server_name: String,
    },
    /// Peer → host: a tunneled HTTP-style request.
    ApiRequest {
        request_id: String,
        method: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
    /// Host → peer: the correlated response.
    ApiResponse {
        request_id: String,
        ok: bool,
        status: u16,
        data: Value,
    },
    /// Peer → host: a playback command outside the HTTP surface.
    PlaybackCommand {
        request_id: String,
        #[serde(flatten)]
        command: PlaybackCommand,
    },
    /// Host → peer: acknowledgement of a playback command.
    CommandAck {
        request_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ─── Control frame builders ──────────────────────────────────────────────────

pub fn register_frame(
    room_id: &str,
    server_name: &str,
    sealing_pubkey: &str,
    signing_pubkey: &str,
    signature: &str,
    password_hash: Option<&str>,
) -> String {
    let mut body = json!({
        "room_id": room_id,
        "server_name": server_name,
        "pubkey": sealing_pubkey,
        "signing_key": signing_pubkey,
        "sig": signature,
    });
    if let Some(hash) = password_hash {
        body["password_hash"] = json!(hash);
    }
    json!(["register", body]).to_string()
}

pub fn join_frame(
    room_id: &str,
    ephemeral_pubkey: &str,
    device_name: &str,
    user_agent: &str,
    password_hash: Option<&str>,
) -> String {
    let mut body = json!({
        "room_id": room_id,
        "pubkey": ephemeral_pubkey,
        "device_name": device_name,
        "user_agent": user_agent,
    });
    if let Some(hash) = password_hash {
        body["password_hash"] = json!(hash);
    }
    json!(["join", body]).to_string()
}

pub fn ping_frame() -> String {
    json!(["ping"]).to_string()
}

pub fn data_frame(peer_id: &str, sealed: &str) -> String {
    json!(["frame", peer_id, sealed]).to_string()
}

// ─── Inbound control parsing ─────────────────────────────────────────────────

/// A parsed relay→endpoint message.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Registered,
    PeerJoined { peer_id: String, device_name: String },
    PeerLeft { peer_id: String },
    Joined { host_pubkey: String, server_name: Option<String> },
    AuthRequired,
    Error { code: Option<String>, message: String },
    /// Opaque data frame; `peer_id` names the non-host endpoint.
    Frame { peer_id: String, sealed: String },
}

/// Parse one inbound text frame. Unknown or malformed frames yield `None`
/// and are dropped silently, per the error policy.
pub fn parse_event(text: &str) -> Option<RelayEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let kind = arr.first()?.as_str()?;

    match kind {
        "registered" => Some(RelayEvent::Registered),
        "peer_joined" => {
            let body = arr.get(1)?;
            Some(RelayEvent::PeerJoined {
                peer_id: body["peer_id"].as_str()?.to_string(),
                device_name: body["device_name"].as_str().unwrap_or_default().to_string(),
            })
        }
        "peer_left" => {
            let body = arr.get(1)?;
            Some(RelayEvent::PeerLeft {
                peer_id: body["peer_id"].as_str()?.to_string(),
            })
        }
        "joined" => {
            let body = arr.get(1)?;
            Some(RelayEvent::Joined {
                host_pubkey: body["host_pubkey"].as_str()?.to_string(),
                server_name: body["server_name"].as_str().map(str::to_string),
            })
        }
        "auth-required" => Some(RelayEvent::AuthRequired),
        "error" => {
            let body = arr.get(1).cloned().unwrap_or_default();
            Some(RelayEvent::Error {
                code: body["code"].as_str().map(str::to_string),
                message: body["message"].as_str().unwrap_or_default().to_string(),
            })
        }
        "frame" => Some(RelayEvent::Frame {
            peer_id: arr.get(1)?.as_str()?.to_string(),
            sealed: arr.get(2)?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
