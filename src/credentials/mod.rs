//! Login credentials: the generated passphrase, an optional custom password,
//! and the legacy access token.
//!
//! Exactly one of passphrase / custom password is the active login secret
//! (`use_custom` selects which). Both are stored as salted argon2id hashes in
//! `{data_dir}/auth.json`; the passphrase plaintext is kept alongside so the
//! host UI can display it. The legacy access token is a 32-char hex secret in
//! `{data_dir}/access_token` (mode 0600) used by pre-pairing clients and by
//! the relay `welcome` frame.

pub mod words;

use anyhow::{Context, Result};
use argon2::password_hash::{rand_core::OsRng as SaltRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use tracing::{info, warn};

const AUTH_FILE: &str = "auth.json";
const ACCESS_TOKEN_FILE: &str = "access_token";

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// The supplied password fails the minimum policy. Carries the reasons.
    #[error("password rejected: {}", .0.join("; "))]
    InvalidPolicy(Vec<String>),
}

// ─── Persisted form ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct AuthFile {
    /// Plaintext passphrase, displayable in the host UI.
    passphrase: String,
    /// argon2id PHC string of the passphrase.
    passphrase_hash: String,
    /// argon2id PHC string of the custom password, when one is set.
    #[serde(default)]
    custom_password_hash: Option<String>,
    /// When true the custom password is the active login credential.
    #[serde(default)]
    use_custom: bool,
}

struct Credentials {
    passphrase: String,
    passphrase_hash: String,
    custom_password_hash: Option<String>,
    use_custom: bool,
    access_token: String,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct CredentialManager {
    auth_path: PathBuf,
    token_path: PathBuf,
    inner: RwLock<Credentials>,
}

impl CredentialManager {
    /// Load `{data_dir}/auth.json` + `{data_dir}/access_token`, generating
    /// fresh secrets when either is absent or unreadable.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let auth_path = data_dir.join(AUTH_FILE);
        let token_path = data_dir.join(ACCESS_TOKEN_FILE);

        let (passphrase, passphrase_hash, custom_password_hash, use_custom) =
            match std::fs::read_to_string(&auth_path)
                .ok()
                .and_then(|s| serde_json::from_str::<AuthFile>(&s).ok())
            {
                Some(f) => (f.passphrase, f.passphrase_hash, f.custom_password_hash, f.use_custom),
                None => {
                    let passphrase = generate_passphrase();
                    let hash = hash_secret(&passphrase)?;
                    info!("generated new login passphrase");
                    (passphrase, hash, None, false)
                }
            };

        let access_token = load_or_create_access_token(&token_path)?;

        let creds = Credentials {
            passphrase,
            passphrase_hash,
            custom_password_hash,
            use_custom,
            access_token,
        };
        // First start: make sure the generated secrets hit disk.
        persist(&auth_path, &creds);

        Ok(Self {
            auth_path,
            token_path,
            inner: RwLock::new(creds),
        })
    }

    /// The displayable passphrase (host UI shows it next to the QR code).
    pub async fn passphrase(&self) -> String {
        self.inner.read().await.passphrase.clone()
    }

    pub async fn use_custom(&self) -> bool {
        self.inner.read().await.use_custom
    }

    /// Verify a login attempt against the active credential.
    /// Constant-time via the argon2 verifier.
    pub async fn verify(&self, password: &str) -> bool {
        let creds = self.inner.read().await;
        let hash = if creds.use_custom {
            match &creds.custom_password_hash {
                Some(h) => h.as_str(),
                None => return false,
            }
        } else {
            creds.passphrase_hash.as_str()
        };
        verify_against(password, hash)
    }

    /// Minimum policy: length, at least one letter, at least one digit.
    /// Returns the empty vec when the password passes.
    pub fn validate_password(password: &str) -> Vec<String> {
        let mut reasons = Vec::new();
        if password.chars().count() < MIN_PASSWORD_LEN {
            reasons.push(format!("must be at least {MIN_PASSWORD_LEN} characters"));
        }
        if !password.chars().any(|c| c.is_alphabetic()) {
            reasons.push("must contain at least one letter".to_string());
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            reasons.push("must contain at least one digit".to_string());
        }
        reasons
    }

    /// Set a custom password and make it the active credential.
    pub async fn set_custom_password(&self, password: &str) -> Result<(), CredentialError> {
        let reasons = Self::validate_password(password);
        if !reasons.is_empty() {
            return Err(CredentialError::InvalidPolicy(reasons));
        }
        let hash = hash_secret(password)
            .map_err(|_| CredentialError::InvalidPolicy(vec!["could not hash password".into()]))?;

        let mut creds = self.inner.write().await;
        creds.custom_password_hash = Some(hash);
        creds.use_custom = true;
        persist(&self.auth_path, &creds);
        Ok(())
    }

    /// Switch between passphrase and custom password as the active credential.
    /// Selecting the custom password with none set is a no-op returning false.
    pub async fn set_use_custom(&self, use_custom: bool) -> bool {
        let mut creds = self.inner.write().await;
        if use_custom && creds.custom_password_hash.is_none() {
            return false;
        }
        creds.use_custom = use_custom;
        persist(&self.auth_path, &creds);
        true
    }

    /// Replace the passphrase with a freshly generated one. Devices stay
    /// valid — they are credentialed separately.
    pub async fn regenerate(&self) -> Result<String> {
        let passphrase = generate_passphrase();
        let hash = hash_secret(&passphrase)?;

        let mut creds = self.inner.write().await;
        creds.passphrase = passphrase.clone();
        creds.passphrase_hash = hash;
        persist(&self.auth_path, &creds);
        Ok(passphrase)
    }

    // ─── Legacy access token ─────────────────────────────────────────────────

    pub async fn access_token(&self) -> String {
        self.inner.read().await.access_token.clone()
    }

    /// Constant-time check of a presented legacy access token.
    pub async fn check_access_token(&self, presented: &str) -> bool {
        constant_time_eq(presented, &self.inner.read().await.access_token)
    }

    /// Mint a new access token, invalidating the old one immediately.
    pub async fn rotate_access_token(&self) -> String {
        let token = Uuid::new_v4().to_string().replace('-', "");
        let mut creds = self.inner.write().await;
        creds.access_token = token.clone();
        if let Err(e) = write_secret_file(&self.token_path, token.as_bytes()) {
            warn!(err = %e, "failed to persist rotated access token — keeping in memory");
        }
        token
    }
}

// ─── Passphrase generation ───────────────────────────────────────────────────

/// `{adjective}-{noun}-{nn}` drawn uniformly from the curated word lists.
pub fn generate_passphrase() -> String {
    let mut rng = rand::thread_rng();
    let adjective = words::ADJECTIVES[rng.gen_range(0..words::ADJECTIVES.len())];
    let noun = words::NOUNS[rng.gen_range(0..words::NOUNS.len())];
    let nn: u8 = rng.gen_range(10..100);
    format!("{adjective}-{noun}-{nn}")
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut SaltRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hashing failed: {e}"))?;
    Ok(hash.to_string())
}

fn verify_against(secret: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Constant-time string comparison to prevent timing-based token oracles.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── Persistence ─────────────────────────────────────────────────────────────

fn persist(path: &Path, creds: &Credentials) {
    let file = AuthFile {
        passphrase: creds.passphrase.clone(),
        passphrase_hash: creds.passphrase_hash.clone(),
        custom_password_hash: creds.custom_password_hash.clone(),
        use_custom: creds.use_custom,
    };
    let json = match serde_json::to_string_pretty(&file) {
        Ok(j) => j,
        Err(e) => {
            warn!(err = %e, "failed to serialize auth.json — keeping in memory");
            return;
        }
    };
    let tmp = path.with_extension("json.tmp");
    let result = write_secret_file(&tmp, json.as_bytes()).and_then(|_| std::fs::rename(&tmp, path));
    if let Err(e) = result {
        warn!(err = %e, "failed to save auth.json — keeping in memory");
    }
}

fn load_or_create_access_token(path: &Path) -> Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }
    let token = Uuid::new_v4().to_string().replace('-', "");
    write_secret_file(path, token.as_bytes())?;
    Ok(token)
}

/// Create the file with owner-only permissions from the start to eliminate
/// the TOCTOU window that would exist if we wrote first and chmod'd second.
fn write_secret_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        f.write_all(bytes)?;
        Ok(())
    }
    #[cfg(not(unix))]
    std::fs::write(path, bytes)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn passphrase_shape_is_word_word_number() {
        let p = generate_passphrase();
        let parts: Vec<&str> = p.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(words::ADJECTIVES.contains(&parts[0]));
        assert!(words::NOUNS.contains(&parts[1]));
        assert!(parts[2].parse::<u8>().is_ok());
    }

    #[tokio::test]
    async fn verify_accepts_the_active_credential_only() {
        let dir = TempDir::new().unwrap();
        let mgr = CredentialManager::load_or_create(dir.path()).unwrap();
        let passphrase = mgr.passphrase().await;

        assert!(mgr.verify(&passphrase).await);
        assert!(!mgr.verify("wrong-secret-99").await);

        mgr.set_custom_password("hunter42x").await.unwrap();
        assert!(mgr.verify("hunter42x").await);
        // Passphrase is no longer the active credential.
        assert!(!mgr.verify(&passphrase).await);

        assert!(mgr.set_use_custom(false).await);
        assert!(mgr.verify(&passphrase).await);
    }

    #[tokio::test]
    async fn weak_custom_password_is_rejected_with_reasons() {
        let dir = TempDir::new().unwrap();
        let mgr = CredentialManager::load_or_create(dir.path()).unwrap();
        let err = mgr.set_custom_password("short").await.unwrap_err();
        match err {
            CredentialError::InvalidPolicy(reasons) => {
                assert!(reasons.len() >= 2); // too short + no digit
            }
        }
    }

    #[tokio::test]
    async fn regenerate_replaces_the_passphrase() {
        let dir = TempDir::new().unwrap();
        let mgr = CredentialManager::load_or_create(dir.path()).unwrap();
        let old = mgr.passphrase().await;
        let new = mgr.regenerate().await.unwrap();
        assert_ne!(old, new);
        assert!(mgr.verify(&new).await);
        assert!(!mgr.verify(&old).await);
    }

    #[tokio::test]
    async fn credentials_survive_reload() {
        let dir = TempDir::new().unwrap();
        let first = CredentialManager::load_or_create(dir.path()).unwrap();
        let passphrase = first.passphrase().await;
        let token = first.access_token().await;
        drop(first);

        let second = CredentialManager::load_or_create(dir.path()).unwrap();
        assert_eq!(second.passphrase().await, passphrase);
        assert_eq!(second.access_token().await, token);
        assert!(second.verify(&passphrase).await);
    }

    #[tokio::test]
    async fn rotate_invalidates_the_old_access_token() {
        let dir = TempDir::new().unwrap();
        let mgr = CredentialManager::load_or_create(dir.path()).unwrap();
        let old = mgr.access_token().await;
        let new = mgr.rotate_access_token().await;
        assert_ne!(old, new);
        assert!(mgr.check_access_token(&new).await);
        assert!(!mgr.check_access_token(&old).await);
    }
}
