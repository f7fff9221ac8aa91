//! Device Pairing data model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A pairing code waiting to be consumed.
///
/// Two schemes share this record: the memorable `WORD-WORD-NN` code tied to
/// the relay room (no expiry; rotated after each successful consume) and the
/// one-time opaque code (5-minute expiry) minted for approval flows.
#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub created_at: DateTime<Utc>,
    /// None = does not expire (memorable scheme).
    pub expires_at: Option<DateTime<Utc>>,
    pub consumed: bool,
}

impl PairingCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if now >= t)
    }
}

/// `current_code()` response — everything the host UI needs to display
/// pairing instructions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeInfo {
    pub code: String,
    /// URL the mobile client opens to auto-pair.
    pub qr_payload: String,
    /// Terminal-renderable QR of the payload (unicode half-blocks).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_text: Option<String>,
    pub local_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of consuming a pairing code.
///
/// `success == false` with `requires_approval == true` means the host did not
/// act on the approval request before the deadline.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parameters for `POST /api/auth/pair` — sent by the device being paired.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub code: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// An approval request surfaced to the host UI while a `consume` call waits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub device_name: String,
    pub user_agent: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    /// The code was never issued (or was already swept).
    #[error("pairing code rejected")]
    Unknown,
    /// The code exists but its deadline has passed.
    #[error("pairing code expired")]
    Expired,
    /// The code was already consumed — exactly one caller wins.
    #[error("pairing code already used")]
    Conflict,
    /// The host denied the approval request.
    #[error("pairing denied by host")]
    Denied,
    /// The host is shutting down; the wait was abandoned.
    #[error("pairing cancelled")]
    Cancelled,
}
