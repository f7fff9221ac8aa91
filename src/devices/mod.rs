//! Device Registry — issues, validates, refreshes, and revokes the
//! long-lived credentials of paired devices.
//!
//! The wire form of a device credential is `"<device_id>:<token>"`. The
//! registry stores only the SHA-256 of the token; validation hashes the
//! presented secret and compares in constant time.

pub mod model;

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use ulid::Ulid;
use uuid::Uuid;

use crate::credentials::constant_time_eq;
use crate::storage::with_timeout;
use model::{Device, DeviceError, DeviceRecord};

pub struct DeviceRegistry {
    pool: SqlitePool,
}

impl DeviceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mint a device and its opaque token.
    ///
    /// Returns `(device_id, combined_token, expires_at)`. The combined token
    /// is the only time the cleartext secret leaves the registry.
    pub async fn register(
        &self,
        name: &str,
        user_agent: &str,
        expires_at: Option<i64>,
    ) -> Result<(String, String, Option<i64>)> {
        let id = Ulid::new().to_string();
        let token = Uuid::new_v4().to_string().replace('-', "");
        let now = Utc::now().timestamp();

        let pool = self.pool.clone();
        let (id2, token_hash, name, user_agent) =
            (id.clone(), hash_token(&token), name.to_string(), user_agent.to_string());
        with_timeout(async move {
            sqlx::query(
                "INSERT INTO devices (id, name, user_agent, token_hash, created_at, expires_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id2)
            .bind(&name)
            .bind(&user_agent)
            .bind(&token_hash)
            .bind(now)
            .bind(expires_at)
            .execute(&pool)
            .await?;
            Ok(())
        })
        .await?;

        Ok((id.clone(), format!("{id}:{token}"), expires_at))
    }

    /// Validate a combined `"<device_id>:<token>"` credential.
    ///
    /// On success updates `last_seen_at` and returns the device id.
    pub async fn validate(&self, combined: &str) -> Result<String, DeviceError> {
        let (id, token) = parse_combined(combined)?;
        let device = self.fetch(&id).await?.ok_or(DeviceError::Unknown)?;

        if device.is_revoked() {
            return Err(DeviceError::Revoked);
        }
        if device.is_expired(Utc::now().timestamp()) {
            return Err(DeviceError::Expired);
        }
        if !constant_time_eq(&hash_token(&token), &device.token_hash) {
            return Err(DeviceError::Mismatch);
        }

        let pool = self.pool.clone();
        let now = Utc::now().timestamp();
        let id2 = id.clone();
        // last_seen is best-effort; a failed write must not fail the auth.
        let _ = with_timeout(async move {
            sqlx::query("UPDATE devices SET last_seen_at = ? WHERE id = ?")
                .bind(now)
                .bind(&id2)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await;

        Ok(id)
    }

    /// Rotate the secret half of a device credential, preserving the id.
    /// Returns the new combined token and the (unchanged) expiry.
    pub async fn refresh(
        &self,
        device_id: &str,
        old_token: &str,
    ) -> Result<(String, Option<i64>), DeviceError> {
        let device = self.fetch(device_id).await?.ok_or(DeviceError::Unknown)?;

        if device.is_revoked() {
            return Err(DeviceError::Revoked);
        }
        if device.is_expired(Utc::now().timestamp()) {
            return Err(DeviceError::Expired);
        }
        if !constant_time_eq(&hash_token(old_token), &device.token_hash) {
            return Err(DeviceError::Mismatch);
        }

        let token = Uuid::new_v4().to_string().replace('-', "");
        let pool = self.pool.clone();
        let (id2, token_hash) = (device_id.to_string(), hash_token(&token));
        with_timeout(async move {
            sqlx::query("UPDATE devices SET token_hash = ? WHERE id = ?")
                .bind(&token_hash)
                .bind(&id2)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await
        .map_err(|_| DeviceError::Unknown)?;

        Ok((format!("{device_id}:{token}"), device.expires_at))
    }

    /// Mark a device revoked; its token stops granting access but the
    /// record stays listable. Returns false when no active device existed.
    pub async fn revoke(&self, device_id: &str) -> Result<bool> {
        let pool = self.pool.clone();
        let id = device_id.to_string();
        with_timeout(async move {
            let result = sqlx::query("UPDATE devices SET revoked = 1 WHERE id = ? AND revoked = 0")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Revoke every active device. Returns the count revoked.
    pub async fn revoke_all(&self) -> Result<u64> {
        let pool = self.pool.clone();
        with_timeout(async move {
            let result = sqlx::query("UPDATE devices SET revoked = 1 WHERE revoked = 0")
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Redacted device records (no secrets), newest first.
    pub async fn list(&self) -> Result<Vec<DeviceRecord>> {
        let pool = self.pool.clone();
        let devices = with_timeout(async move {
            let rows: Vec<Device> =
                sqlx::query_as("SELECT * FROM devices ORDER BY created_at DESC")
                    .fetch_all(&pool)
                    .await?;
            Ok(rows)
        })
        .await?;
        Ok(devices.into_iter().map(DeviceRecord::from).collect())
    }

    async fn fetch(&self, id: &str) -> Result<Option<Device>, DeviceError> {
        let pool = self.pool.clone();
        let id = id.to_string();
        with_timeout(async move {
            let row: Option<Device> = sqlx::query_as("SELECT * FROM devices WHERE id = ?")
                .bind(&id)
                .fetch_optional(&pool)
                .await?;
            Ok(row)
        })
        .await
        .map_err(|_| DeviceError::Unknown)
    }
}

fn parse_combined(combined: &str) -> Result<(String, String), DeviceError> {
    match combined.split_once(':') {
        Some((id, token)) if !id.is_empty() && !token.is_empty() => {
            Ok((id.to_string(), token.to_string()))
        }
        _ => Err(DeviceError::Malformed),
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn registry() -> DeviceRegistry {
        let storage = Storage::in_memory().await.unwrap();
        DeviceRegistry::new(storage.pool())
    }

    #[tokio::test]
    async fn register_then_validate_round_trip() {
        let reg = registry().await;
        let (id, combined, _) = reg.register("My iPhone", "Encore-iOS/1.0", None).await.unwrap();
        assert_eq!(reg.validate(&combined).await.unwrap(), id);
    }

    #[tokio::test]
    async fn malformed_tokens_are_rejected() {
        let reg = registry().await;
        assert_eq!(reg.validate("no-colon-here").await, Err(DeviceError::Malformed));
        assert_eq!(reg.validate(":empty-id").await, Err(DeviceError::Malformed));
        assert_eq!(reg.validate("empty-token:").await, Err(DeviceError::Malformed));
    }

    #[tokio::test]
    async fn wrong_secret_is_a_mismatch() {
        let reg = registry().await;
        let (id, _, _) = reg.register("Pixel", "", None).await.unwrap();
        assert_eq!(
            reg.validate(&format!("{id}:0000000000000000")).await,
            Err(DeviceError::Mismatch)
        );
    }

    #[tokio::test]
    async fn expired_devices_are_rejected() {
        let reg = registry().await;
        let past = Utc::now().timestamp() - 60;
        let (_, combined, _) = reg.register("Old", "", Some(past)).await.unwrap();
        assert_eq!(reg.validate(&combined).await, Err(DeviceError::Expired));
    }

    #[tokio::test]
    async fn revoke_invalidates_the_token() {
        let reg = registry().await;
        let (id, combined, _) = reg.register("Tablet", "", None).await.unwrap();
        let secret = combined.split_once(':').unwrap().1.to_string();

        assert!(reg.revoke(&id).await.unwrap());
        assert_eq!(reg.validate(&combined).await, Err(DeviceError::Revoked));
        // Revoked devices cannot rotate their way back in either.
        assert_eq!(reg.refresh(&id, &secret).await, Err(DeviceError::Revoked));
        // Second revoke is a no-op.
        assert!(!reg.revoke(&id).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_rotates_the_secret_half_only() {
        let reg = registry().await;
        let (id, combined, _) = reg.register("Phone", "", None).await.unwrap();
        let old_secret = combined.split_once(':').unwrap().1.to_string();

        let (new_combined, _) = reg.refresh(&id, &old_secret).await.unwrap();
        assert!(new_combined.starts_with(&format!("{id}:")));
        assert_ne!(new_combined, combined);

        assert_eq!(reg.validate(&combined).await, Err(DeviceError::Mismatch));
        assert_eq!(reg.validate(&new_combined).await.unwrap(), id);
    }

    #[tokio::test]
    async fn list_is_redacted_and_revoke_all_counts() {
        let reg = registry().await;
        reg.register("A", "ua-a", None).await.unwrap();
        reg.register("B", "ua-b", None).await.unwrap();

        let listed = reg.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|d| !d.revoked));
        // Serialized form must not contain any token material.
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("token"));

        assert_eq!(reg.revoke_all().await.unwrap(), 2);
        // Revoked records stay listable for the host UI.
        let listed = reg.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|d| d.revoked));
        // A second pass finds nothing active.
        assert_eq!(reg.revoke_all().await.unwrap(), 0);
    }
}
