//! Device Registry data model types.

use serde::Serialize;
use thiserror::Error;

/// A device that has completed the pairing flow and holds a long-lived token.
///
/// `token_hash` is the SHA-256 hex digest of the secret half of the device
/// credential — the cleartext is returned exactly once, in the pair or
/// refresh response, and never persisted.
///
/// **Never send this struct to a client over the wire.** Use [`DeviceRecord`]
/// for all outbound JSON — it omits the token hash.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub user_agent: String,
    pub token_hash: String,
    pub created_at: i64,
    pub last_seen_at: Option<i64>,
    /// Unix seconds after which the token is rejected. NULL = never expires.
    pub expires_at: Option<i64>,
    /// `0` = active, `1` = revoked (SQLite INTEGER).
    pub revoked: i64,
}

impl Device {
    pub fn is_revoked(&self) -> bool {
        self.revoked != 0
    }

    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

/// Public view of a paired device — safe to send to any connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub user_agent: String,
    pub created_at: i64,
    pub last_seen_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub revoked: bool,
}

impl From<Device> for DeviceRecord {
    fn from(d: Device) -> Self {
        let revoked = d.is_revoked();
        Self {
            id: d.id,
            name: d.name,
            user_agent: d.user_agent,
            created_at: d.created_at,
            last_seen_at: d.last_seen_at,
            expires_at: d.expires_at,
            revoked,
        }
    }
}

/// Why a combined device token was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Not in `"<device_id>:<token>"` form.
    #[error("malformed device token")]
    Malformed,
    /// No device with the referenced id.
    #[error("unknown device")]
    Unknown,
    /// The device credential has passed its expiry.
    #[error("device token expired")]
    Expired,
    /// The secret half does not match the stored hash.
    #[error("device token mismatch")]
    Mismatch,
    /// The device exists but has been revoked.
    #[error("device revoked")]
    Revoked,
}
