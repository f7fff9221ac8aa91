//! Stable server identity for relay registration and E2E sealing.
//!
//! Generates an ed25519 signing keypair and an x25519 sealing key on first
//! run, persists them to `{data_dir}/server-identity.json`, and returns the
//! same identity on every subsequent startup. The `server_id` is a short
//! fingerprint of the verifying key; the relay room id is derived from the
//! same key so the room survives restarts.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

const IDENTITY_FILE: &str = "server-identity.json";

/// Number of fingerprint characters exposed as the `server_id`.
const SERVER_ID_LEN: usize = 8;

// ─── Persisted form ───────────────────────────────────────────────────────────

/// On-disk JSON shape of the identity file. Key material is base64url-nopad.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    signing_key: String,
    sealing_key: String,
    server_name: String,
    relay_room_id: String,
    #[serde(default)]
    generation: u64,
}

// ─── In-memory identity ───────────────────────────────────────────────────────

struct Identity {
    signing_key: SigningKey,
    sealing_key: StaticSecret,
    server_id: String,
    server_name: String,
    relay_room_id: String,
    generation: u64,
}

/// Public projection of the identity — safe to send to any client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub server_id: String,
    pub server_name: String,
    /// base64url-nopad ed25519 verifying key.
    pub public_key: String,
}

/// Owns the server keypair, name, and relay room id.
///
/// All mutation goes through this store; saves are atomic (tmp + rename) and
/// non-fatal — a failed save logs and keeps the in-memory state authoritative
/// until the next successful write.
pub struct IdentityStore {
    path: PathBuf,
    inner: RwLock<Identity>,
}

impl IdentityStore {
    /// Load `{data_dir}/server-identity.json`, or generate a fresh identity
    /// and persist it. A present-but-unreadable file is regenerated and
    /// overwritten rather than failing startup.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = data_dir.join(IDENTITY_FILE);

        let identity = match std::fs::read_to_string(&path) {
            Ok(contents) => match parse_identity(&contents) {
                Ok(id) => id,
                Err(e) => {
                    warn!(err = %e, "identity file unreadable — regenerating");
                    let id = generate_identity();
                    persist(&path, &id);
                    id
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = generate_identity();
                info!(server_id = %id.server_id, "generated new server identity");
                persist(&path, &id);
                id
            }
            Err(e) => {
                warn!(err = %e, "identity file unreadable — regenerating");
                let id = generate_identity();
                persist(&path, &id);
                id
            }
        };

        Ok(Self {
            path,
            inner: RwLock::new(identity),
        })
    }

    pub async fn get_public_identity(&self) -> PublicIdentity {
        let id = self.inner.read().await;
        PublicIdentity {
            server_id: id.server_id.clone(),
            server_name: id.server_name.clone(),
            public_key: URL_SAFE_NO_PAD.encode(id.signing_key.verifying_key().as_bytes()),
        }
    }

    pub async fn server_id(&self) -> String {
        self.inner.read().await.server_id.clone()
    }

    pub async fn server_name(&self) -> String {
        self.inner.read().await.server_name.clone()
    }

    /// Rename the server. Persisted; a save failure is logged and the rename
    /// stays effective in memory.
    pub async fn set_server_name(&self, name: &str) {
        let mut id = self.inner.write().await;
        id.server_name = name.to_string();
        id.generation += 1;
        persist(&self.path, &id);
    }

    pub async fn get_relay_room_id(&self) -> String {
        self.inner.read().await.relay_room_id.clone()
    }

    /// Sign `msg` with the identity key. Returns base64url-nopad signature.
    pub async fn sign(&self, msg: &[u8]) -> String {
        let id = self.inner.read().await;
        URL_SAFE_NO_PAD.encode(id.signing_key.sign(msg).to_bytes())
    }

    /// The long-lived x25519 secret used to open sealed peer frames.
    pub async fn sealing_key(&self) -> StaticSecret {
        self.inner.read().await.sealing_key.clone()
    }

    /// Bump the generation counter (called on credential regeneration).
    pub async fn bump_generation(&self) {
        let mut id = self.inner.write().await;
        id.generation += 1;
        persist(&self.path, &id);
    }

    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }
}

// ─── Derivations ─────────────────────────────────────────────────────────────

/// First [`SERVER_ID_LEN`] base64url chars of SHA-256 of the verifying key.
fn derive_server_id(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded[..SERVER_ID_LEN].to_string()
}

/// Stable relay room id — hex of the first 8 bytes of a domain-separated
/// hash of the verifying key.
fn derive_room_id(verifying_key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"encore-room:");
    hasher.update(verifying_key.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn default_server_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Encore Server".to_string())
}

fn generate_identity() -> Identity {
    let signing_key = SigningKey::generate(&mut OsRng);
    let sealing_key = StaticSecret::random_from_rng(OsRng);
    let verifying = signing_key.verifying_key();
    Identity {
        server_id: derive_server_id(&verifying),
        relay_room_id: derive_room_id(&verifying),
        signing_key,
        sealing_key,
        server_name: default_server_name(),
        generation: 0,
    }
}

fn parse_identity(contents: &str) -> Result<Identity> {
    let file: IdentityFile = serde_json::from_str(contents)?;

    let signing_bytes: [u8; 32] = URL_SAFE_NO_PAD
        .decode(&file.signing_key)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be 32 bytes"))?;
    let sealing_bytes: [u8; 32] = URL_SAFE_NO_PAD
        .decode(&file.sealing_key)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("sealing key must be 32 bytes"))?;

    let signing_key = SigningKey::from_bytes(&signing_bytes);
    let verifying = signing_key.verifying_key();

    Ok(Identity {
        server_id: derive_server_id(&verifying),
        relay_room_id: file.relay_room_id,
        signing_key,
        sealing_key: StaticSecret::from(sealing_bytes),
        server_name: file.server_name,
        generation: file.generation,
    })
}

/// Atomic save: write a sibling tmp file, then rename over the target.
/// Save failures are non-fatal — the in-memory identity stays authoritative.
fn persist(path: &Path, id: &Identity) {
    let file = IdentityFile {
        signing_key: URL_SAFE_NO_PAD.encode(id.signing_key.to_bytes()),
        sealing_key: URL_SAFE_NO_PAD.encode(id.sealing_key.to_bytes()),
        server_name: id.server_name.clone(),
        relay_room_id: id.relay_room_id.clone(),
        generation: id.generation,
    };
    let json = match serde_json::to_string_pretty(&file) {
        Ok(j) => j,
        Err(e) => {
            warn!(err = %e, "failed to serialize identity — keeping in memory");
            return;
        }
    };

    let tmp = path.with_extension("json.tmp");
    let result = write_secret_file(&tmp, json.as_bytes()).and_then(|_| {
        std::fs::rename(&tmp, path)?;
        Ok(())
    });
    if let Err(e) = result {
        warn!(err = %e, path = %path.display(), "failed to save identity — keeping in memory");
    }
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
