//! Push notifications fanned out to live clients.
//!
//! Every server→client notification is a typed [`HostEvent`]. On the wire it
//! is a `{type, payload}` frame — the same shape on the local WebSocket and,
//! sealed, through the relay to remote peers. Frames are serialized once at
//! the broadcast site; the socket loops forward the pre-encoded string to
//! however many subscribers are listening.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::pairing::model::ApprovalRequest;

/// A server→client push notification.
///
/// The variant name is the wire `type`; the fields are the `payload`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum HostEvent {
    /// Session roster info, sent to a client right after its upgrade.
    #[serde(rename_all = "camelCase")]
    SessionUpdate {
        session_id: String,
        active_sessions: usize,
    },
    /// The desktop player's current playback state, as the shell reports it.
    DesktopState(Value),
    /// A pairing consume is parked waiting for the host's decision.
    PairingApproval(ApprovalRequest),
    /// A new device completed pairing. Never carries the device token.
    #[serde(rename_all = "camelCase")]
    DevicePaired { device_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    DeviceRevoked { device_id: String },
    /// Remote-access health, surfaced in the host UI.
    RelayStatus {
        state: RelayState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Connected,
    Failed,
}

impl HostEvent {
    /// The wire frame, ready for a socket loop to send.
    pub fn frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Fans [`HostEvent`] frames out to every connected WebSocket client and to
/// the relay forwarder. Senders never block; a subscriber that lags just
/// skips frames.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn broadcast(&self, event: HostEvent) {
        // A send error just means nobody is listening right now.
        let _ = self.tx.send(event.frame());
    }

    /// Pre-serialized frames, in broadcast order.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_carry_the_kebab_case_type_tag() {
        let frame: Value = serde_json::from_str(
            &HostEvent::DevicePaired {
                device_id: "D1".into(),
                name: "My iPhone".into(),
            }
            .frame(),
        )
        .unwrap();
        assert_eq!(frame["type"], "device-paired");
        assert_eq!(frame["payload"]["deviceId"], "D1");
        assert_eq!(frame["payload"]["name"], "My iPhone");
    }

    #[test]
    fn session_update_uses_camel_case_payload_keys() {
        let frame: Value = serde_json::from_str(
            &HostEvent::SessionUpdate {
                session_id: "s-1".into(),
                active_sessions: 3,
            }
            .frame(),
        )
        .unwrap();
        assert_eq!(frame["type"], "session-update");
        assert_eq!(frame["payload"]["sessionId"], "s-1");
        assert_eq!(frame["payload"]["activeSessions"], 3);
    }

    #[test]
    fn relay_status_omits_an_absent_reason() {
        let up: Value = serde_json::from_str(
            &HostEvent::RelayStatus {
                state: RelayState::Connected,
                reason: None,
            }
            .frame(),
        )
        .unwrap();
        assert_eq!(up["payload"]["state"], "connected");
        assert!(up["payload"].get("reason").is_none());

        let down: Value = serde_json::from_str(
            &HostEvent::RelayStatus {
                state: RelayState::Failed,
                reason: Some("max reconnect attempts".into()),
            }
            .frame(),
        )
        .unwrap();
        assert_eq!(down["payload"]["state"], "failed");
        assert_eq!(down["payload"]["reason"], "max reconnect attempts");
    }

    #[tokio::test]
    async fn subscribers_receive_broadcast_frames() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(HostEvent::DesktopState(json!({ "playing": true })));
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "desktop-state");
        assert_eq!(frame["payload"]["playing"], true);
    }

    #[test]
    fn broadcasting_with_no_subscribers_is_fine() {
        EventBroadcaster::new().broadcast(HostEvent::DeviceRevoked {
            device_id: "D1".into(),
        });
    }
}
