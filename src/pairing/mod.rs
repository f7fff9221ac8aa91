//! Pairing Coordinator — turns short codes into device credentials.
//!
//! Two interchangeable schemes:
//! - the memorable `WORD-WORD-NN` code, minted once per server session and
//!   rotated after every successful consume (printed at startup, embedded in
//!   the QR payload);
//! - 5-minute one-time opaque codes for "approve new device" flows.
//!
//! Race contract: a code consumes at most once. Concurrent `consume` calls
//! serialize on the code table lock and exactly one marks the code consumed;
//! the rest see `Conflict`.
//!
//! With `require_approval` enabled, `consume` parks on a oneshot channel
//! until the host approves, denies, the 60 s deadline passes, or shutdown
//! cancels the wait.

pub mod model;

use chrono::{Duration as ChronoDuration, Utc};
use qrcode::QrCode;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials::words;
use crate::devices::DeviceRegistry;
use crate::events::{EventBroadcaster, HostEvent};
use model::{ApprovalRequest, CodeInfo, PairOutcome, PairingCode, PairingError};

/// One-time opaque codes live this long.
const ONE_TIME_TTL_MINS: i64 = 5;
/// How long a `consume` call waits for host approval.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

struct PendingApproval {
    request: ApprovalRequest,
    decision_tx: oneshot::Sender<bool>,
}

pub struct PairingCoordinator {
    devices: Arc<DeviceRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    codes: Mutex<HashMap<String, PairingCode>>,
    /// The memorable code currently shown by the host UI.
    current: Mutex<String>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    require_approval: AtomicBool,
    approval_timeout: Duration,
    local_url: String,
    relay_room_id: String,
    shutdown: watch::Receiver<bool>,
}

impl PairingCoordinator {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        local_url: String,
        relay_room_id: String,
        require_approval: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let code = generate_memorable_code();
        let mut codes = HashMap::new();
        codes.insert(
            code.clone(),
            PairingCode {
                code: code.clone(),
                created_at: Utc::now(),
                expires_at: None,
                consumed: false,
            },
        );
        Self {
            devices,
            broadcaster,
            codes: Mutex::new(codes),
            current: Mutex::new(code),
            pending: Mutex::new(HashMap::new()),
            require_approval: AtomicBool::new(require_approval),
            approval_timeout: APPROVAL_TIMEOUT,
            local_url,
            relay_room_id,
            shutdown,
        }
    }

    /// Shrink the approval deadline (tests only).
    #[doc(hidden)]
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    // ─── Codes ───────────────────────────────────────────────────────────────

    /// The memorable code the host UI currently displays, with QR payload.
    pub async fn current_code(&self) -> CodeInfo {
        let code = self.current.lock().await.clone();
        let expires_at = self
            .codes
            .lock()
            .await
            .get(&code)
            .and_then(|c| c.expires_at);
        self.code_info(code, expires_at)
    }

    /// Replace the memorable code (explicit refresh from the host UI).
    pub async fn refresh_code(&self) -> CodeInfo {
        let code = self.rotate_memorable().await;
        self.code_info(code, None)
    }

    /// Mint a 5-minute one-time opaque code. Dead codes are swept here so
    /// the table stays bounded.
    pub async fn mint_one_time(&self) -> CodeInfo {
        let code = Uuid::new_v4().to_string().replace('-', "");
        let expires_at = Utc::now() + ChronoDuration::minutes(ONE_TIME_TTL_MINS);
        let now = Utc::now();
        let mut codes = self.codes.lock().await;
        codes.retain(|_, c| !c.is_expired(now));
        codes.insert(
            code.clone(),
            PairingCode {
                code: code.clone(),
                created_at: now,
                expires_at: Some(expires_at),
                consumed: false,
            },
        );
        drop(codes);
        self.code_info(code, Some(expires_at))
    }

    /// True when the code exists, is unconsumed, and is not expired.
    pub async fn is_valid(&self, code: &str) -> bool {
        let codes = self.codes.lock().await;
        match lookup(&codes, code) {
            Some(c) => !c.consumed && !c.is_expired(Utc::now()),
            None => false,
        }
    }

    // ─── Consume ─────────────────────────────────────────────────────────────

    /// Consume a pairing code and mint a device credential.
    ///
    /// With approval required this blocks (cooperatively) until the host
    /// decides or the deadline passes; the deadline outcome is
    /// `Ok(success=false, requires_approval=true)`.
    pub async fn consume(
        &self,
        code: &str,
        device_name: &str,
        user_agent: &str,
    ) -> Result<PairOutcome, PairingError> {
        // Check-and-mark under one lock: exactly one caller wins the code.
        let canonical = {
            let mut codes = self.codes.lock().await;
            let canonical = lookup_key(&codes, code).ok_or(PairingError::Unknown)?;
            let entry = codes.get_mut(&canonical).ok_or(PairingError::Unknown)?;
            if entry.is_expired(Utc::now()) {
                codes.remove(&canonical);
                return Err(PairingError::Expired);
            }
            if entry.consumed {
                return Err(PairingError::Conflict);
            }
            entry.consumed = true;
            canonical
        };

        // A consumed memorable code is immediately replaced so the host UI
        // always has a valid code to show.
        if *self.current.lock().await == canonical {
            self.rotate_memorable().await;
        }

        if self.require_approval.load(Ordering::SeqCst) {
            self.consume_with_approval(device_name, user_agent).await
        } else {
            self.mint_device(device_name, user_agent).await
        }
    }

    async fn consume_with_approval(
        &self,
        device_name: &str,
        user_agent: &str,
    ) -> Result<PairOutcome, PairingError> {
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            device_name: device_name.to_string(),
            user_agent: user_agent.to_string(),
            requested_at: Utc::now(),
        };
        let (decision_tx, decision_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request.id.clone(),
            PendingApproval {
                request: request.clone(),
                decision_tx,
            },
        );
        self.broadcaster
            .broadcast(HostEvent::PairingApproval(request.clone()));

        let decision = tokio::select! {
            d = decision_rx => d.ok(),
            _ = tokio::time::sleep(self.approval_timeout) => None,
            _ = crate::shutdown::triggered(self.shutdown.clone()) => {
                self.pending.lock().await.remove(&request.id);
                return Err(PairingError::Cancelled);
            }
        };
        self.pending.lock().await.remove(&request.id);

        match decision {
            Some(true) => self.mint_device(device_name, user_agent).await,
            Some(false) => Err(PairingError::Denied),
            None => Ok(PairOutcome {
                success: false,
                device_token: None,
                device_id: None,
                requires_approval: true,
                error: Some("approval timed out".to_string()),
            }),
        }
    }

    async fn mint_device(
        &self,
        device_name: &str,
        user_agent: &str,
    ) -> Result<PairOutcome, PairingError> {
        let name = if device_name.is_empty() {
            "New device"
        } else {
            device_name
        };
        match self.devices.register(name, user_agent, None).await {
            Ok((device_id, device_token, _)) => {
                info!(device = %device_id, "device paired");
                self.broadcaster.broadcast(HostEvent::DevicePaired {
                    device_id: device_id.clone(),
                    name: name.to_string(),
                });
                Ok(PairOutcome {
                    success: true,
                    device_token: Some(device_token),
                    device_id: Some(device_id),
                    requires_approval: false,
                    error: None,
                })
            }
            Err(e) => {
                warn!(err = %e, "device registration failed during pairing");
                Ok(PairOutcome {
                    success: false,
                    device_token: None,
                    device_id: None,
                    requires_approval: false,
                    error: Some("device registration failed".to_string()),
                })
            }
        }
    }

    // ─── Approval sub-API ────────────────────────────────────────────────────

    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .await
            .values()
            .map(|p| p.request.clone())
            .collect()
    }

    /// Returns false when the request id is unknown (already resolved).
    pub async fn approve(&self, request_id: &str) -> bool {
        match self.pending.lock().await.remove(request_id) {
            Some(p) => p.decision_tx.send(true).is_ok(),
            None => false,
        }
    }

    pub async fn deny(&self, request_id: &str) -> bool {
        match self.pending.lock().await.remove(request_id) {
            Some(p) => p.decision_tx.send(false).is_ok(),
            None => false,
        }
    }

    pub fn set_require_approval(&self, require: bool) {
        self.require_approval.store(require, Ordering::SeqCst);
    }

    pub fn require_approval(&self) -> bool {
        self.require_approval.load(Ordering::SeqCst)
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    async fn rotate_memorable(&self) -> String {
        let code = generate_memorable_code();
        self.codes.lock().await.insert(
            code.clone(),
            PairingCode {
                code: code.clone(),
                created_at: Utc::now(),
                expires_at: None,
                consumed: false,
            },
        );
        *self.current.lock().await = code.clone();
        code
    }

    fn code_info(
        &self,
        code: String,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> CodeInfo {
        let qr_payload = format!(
            "{}/?pair={}&room={}",
            self.local_url, code, self.relay_room_id
        );
        let qr_text = QrCode::new(qr_payload.as_bytes()).ok().map(|qr| {
            qr.render::<qrcode::render::unicode::Dense1x2>()
                .quiet_zone(false)
                .build()
        });
        CodeInfo {
            code,
            qr_payload,
            qr_text,
            local_url: self.local_url.clone(),
            expires_at,
        }
    }
}

/// `SWIFT-EAGLE-42` — uppercase words from the shared lists plus two digits.
fn generate_memorable_code() -> String {
    let mut rng = rand::thread_rng();
    let a = words::ADJECTIVES[rng.gen_range(0..words::ADJECTIVES.len())].to_uppercase();
    let b = words::NOUNS[rng.gen_range(0..words::NOUNS.len())].to_uppercase();
    let nn: u8 = rng.gen_range(10..100);
    format!("{a}-{b}-{nn}")
}

/// Case-insensitive lookup: memorable codes are stored uppercase, opaque
/// codes lowercase; clients may type either.
fn lookup<'a>(codes: &'a HashMap<String, PairingCode>, code: &str) -> Option<&'a PairingCode> {
    codes
        .get(code)
        .or_else(|| codes.get(&code.trim().to_uppercase()))
        .or_else(|| codes.get(&code.trim().to_lowercase()))
}

fn lookup_key(codes: &HashMap<String, PairingCode>, code: &str) -> Option<String> {
    lookup(codes, code).map(|c| c.code.clone())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn coordinator(require_approval: bool) -> (Arc<PairingCoordinator>, watch::Sender<bool>) {
        let storage = Storage::in_memory().await.unwrap();
        let devices = Arc::new(DeviceRegistry::new(storage.pool()));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let (tx, rx) = watch::channel(false);
        let coord = PairingCoordinator::new(
            devices,
            broadcaster,
            "http://127.0.0.1:5720".to_string(),
            "roomroom".to_string(),
            require_approval,
            rx,
        )
        .with_approval_timeout(Duration::from_millis(200));
        (Arc::new(coord), tx)
    }

    #[tokio::test]
    async fn consume_mints_a_working_device_token() {
        let (coord, _tx) = coordinator(false).await;
        let code = coord.current_code().await.code;
        assert!(coord.is_valid(&code).await);

        let outcome = coord.consume(&code, "My iPhone", "ua").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.device_token.unwrap().contains(':'));
        assert!(outcome.device_id.is_some());
    }

    #[tokio::test]
    async fn a_code_consumes_exactly_once() {
        let (coord, _tx) = coordinator(false).await;
        let code = coord.current_code().await.code;

        let (a, b) = tokio::join!(
            coord.consume(&code, "A", "ua"),
            coord.consume(&code, "B", "ua"),
        );
        let successes = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Ok(o) if o.success))
            .count();
        assert_eq!(successes, 1);
        assert!(matches!(a, Err(PairingError::Conflict)) || matches!(b, Err(PairingError::Conflict)));
    }

    #[tokio::test]
    async fn memorable_code_rotates_after_consume() {
        let (coord, _tx) = coordinator(false).await;
        let first = coord.current_code().await.code;
        coord.consume(&first, "A", "ua").await.unwrap();
        let second = coord.current_code().await.code;
        assert_ne!(first, second);
        assert!(coord.is_valid(&second).await);
    }

    #[tokio::test]
    async fn expired_one_time_codes_are_rejected() {
        let (coord, _tx) = coordinator(false).await;
        let info = coord.mint_one_time().await;
        // Force the deadline into the past.
        {
            let mut codes = coord.codes.lock().await;
            codes.get_mut(&info.code).unwrap().expires_at =
                Some(Utc::now() - ChronoDuration::seconds(1));
        }
        assert!(!coord.is_valid(&info.code).await);
        assert_eq!(
            coord.consume(&info.code, "A", "ua").await,
            Err(PairingError::Expired)
        );
    }

    #[tokio::test]
    async fn unknown_codes_are_rejected() {
        let (coord, _tx) = coordinator(false).await;
        assert!(!coord.is_valid("NEVER-ISSUED-00").await);
        assert_eq!(
            coord.consume("NEVER-ISSUED-00", "A", "ua").await,
            Err(PairingError::Unknown)
        );
    }

    #[tokio::test]
    async fn approval_flow_approve() {
        let (coord, _tx) = coordinator(true).await;
        let code = coord.current_code().await.code;

        let consumer = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.consume(&code, "Pending", "ua").await })
        };

        // Wait for the request to appear, then approve it.
        let request_id = loop {
            let pending = coord.pending_requests().await;
            if let Some(r) = pending.first() {
                break r.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(coord.approve(&request_id).await);

        let outcome = consumer.await.unwrap().unwrap();
        assert!(outcome.success);
        assert!(coord.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn approval_flow_deny_and_timeout() {
        let (coord, _tx) = coordinator(true).await;

        // Deny path.
        let denied = {
            let coord = Arc::clone(&coord);
            let code = coord.current_code().await.code;
            tokio::spawn(async move { coord.consume(&code, "Denied", "ua").await })
        };
        let request_id = loop {
            if let Some(r) = coord.pending_requests().await.first() {
                break r.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(coord.deny(&request_id).await);
        assert_eq!(denied.await.unwrap(), Err(PairingError::Denied));

        // Timeout path: nobody acts within the (shortened) deadline.
        let code = coord.current_code().await.code;
        let outcome = coord.consume(&code, "Slow", "ua").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.requires_approval);
        assert!(coord.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_approvals() {
        let (coord, tx) = coordinator(true).await;
        let code = coord.current_code().await.code;

        let consumer = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.consume(&code, "Cancelled", "ua").await })
        };
        while coord.pending_requests().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        assert_eq!(consumer.await.unwrap(), Err(PairingError::Cancelled));
    }
}
