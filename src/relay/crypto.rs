//! E2E encryption for relay data frames.
//!
//! Protocol: X25519 key agreement → HKDF-SHA256 key derivation →
//! XChaCha20-Poly1305 AEAD. The peer contributes an ephemeral key per
//! connection; the host contributes its long-lived sealing key, so a peer
//! that knows the host's public key (from the `joined` handshake) can seal
//! frames only the host opens.
//!
//! Two direction-specific keys are derived from the shared secret so each
//! direction has an independent cipher:
//!   `key_c2h` (info = "encore-relay-c2h-v1"): client→host
//!   `key_h2c` (info = "encore-relay-h2c-v1"): host→client
//!
//! Wire format of a sealed payload: base64url-nopad( nonce_24 || ciphertext ),
//! with a fresh random 24-byte nonce per frame. A frame that fails to open
//! is dropped silently by callers.

use anyhow::{anyhow, Context as _, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const INFO_C2H: &[u8] = b"encore-relay-c2h-v1";
const INFO_H2C: &[u8] = b"encore-relay-h2c-v1";

/// XChaCha nonce length in bytes.
const NONCE_LEN: usize = 24;

/// An established sealing channel with one peer.
#[derive(Clone)]
pub struct PeerCrypto {
    cipher_send: XChaCha20Poly1305,
    cipher_recv: XChaCha20Poly1305,
}

impl PeerCrypto {
    /// Host side: long-lived sealing secret × the peer's ephemeral public key.
    pub fn host_side(host_secret: &StaticSecret, peer_pubkey_b64: &str) -> Result<Self> {
        let peer_pk = decode_pubkey(peer_pubkey_b64)?;
        let shared = host_secret.diffie_hellman(&peer_pk);
        Ok(Self {
            cipher_send: derive_cipher(shared.as_bytes(), INFO_H2C)?,
            cipher_recv: derive_cipher(shared.as_bytes(), INFO_C2H)?,
        })
    }

    /// Client side: consumes the connection's ephemeral secret.
    pub fn client_side(client_secret: EphemeralSecret, host_pubkey_b64: &str) -> Result<Self> {
        let host_pk = decode_pubkey(host_pubkey_b64)?;
        let shared = client_secret.diffie_hellman(&host_pk);
        Ok(Self {
            cipher_send: derive_cipher(shared.as_bytes(), INFO_C2H)?,
            cipher_recv: derive_cipher(shared.as_bytes(), INFO_H2C)?,
        })
    }

    /// Seal an outgoing frame. Returns base64url-nopad( nonce || ciphertext ).
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = self
            .cipher_send
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("AEAD encrypt failed"))?;

        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&ct);
        Ok(URL_SAFE_NO_PAD.encode(payload))
    }

    /// Open an incoming frame.
    pub fn open(&self, payload_b64: &str) -> Result<String> {
        let data = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .context("invalid sealed payload encoding")?;
        if data.len() < NONCE_LEN {
            return Err(anyhow!("sealed payload too short"));
        }
        let (nonce_bytes, ct) = data.split_at(NONCE_LEN);

        let pt = self
            .cipher_recv
            .decrypt(XNonce::from_slice(nonce_bytes), ct)
            .map_err(|_| anyhow!("AEAD decrypt failed"))?;
        String::from_utf8(pt).context("decrypted bytes are not valid UTF-8")
    }
}

/// Pre-hash a room password client-side so the host and relay never see the
/// plaintext. Domain-separated SHA-256, hex-encoded.
pub fn hash_room_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"encore-room-pw:");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn decode_pubkey(b64: &str) -> Result<PublicKey> {
    let raw = URL_SAFE_NO_PAD
        .decode(b64)
        .context("invalid public key encoding")?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| anyhow!("public key must be 32 bytes"))?;
    Ok(PublicKey::from(bytes))
}

pub fn encode_pubkey(pk: &PublicKey) -> String {
    URL_SAFE_NO_PAD.encode(pk.as_bytes())
}

fn derive_cipher(ikm: &[u8], info: &[u8]) -> Result<XChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| anyhow!("HKDF expand failed"))?;
    Ok(XChaCha20Poly1305::new(Key::from_slice(&okm)))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng as KeyRng;

    fn channel_pair() -> (PeerCrypto, PeerCrypto) {
        let host_secret = StaticSecret::random_from_rng(KeyRng);
        let host_pub = encode_pubkey(&PublicKey::from(&host_secret));

        let client_secret = EphemeralSecret::random_from_rng(KeyRng);
        let client_pub = encode_pubkey(&PublicKey::from(&client_secret));

        let host = PeerCrypto::host_side(&host_secret, &client_pub).unwrap();
        let client = PeerCrypto::client_side(client_secret, &host_pub).unwrap();
        (host, client)
    }

    #[test]
    fn both_directions_seal_and_open() {
        let (host, client) = channel_pair();

        let sealed = client.seal(r#"{"type":"api-request"}"#).unwrap();
        assert_eq!(host.open(&sealed).unwrap(), r#"{"type":"api-request"}"#);

        let sealed = host.seal(r#"{"type":"welcome"}"#).unwrap();
        assert_eq!(client.open(&sealed).unwrap(), r#"{"type":"welcome"}"#);
    }

    #[test]
    fn nonces_are_fresh_per_frame() {
        let (_, client) = channel_pair();
        let a = client.seal("same plaintext").unwrap();
        let b = client.seal("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_frames_fail_to_open() {
        let (host, client) = channel_pair();
        let sealed = client.seal("payload").unwrap();

        let mut bytes = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(host.open(&URL_SAFE_NO_PAD.encode(bytes)).is_err());
    }

    #[test]
    fn wrong_direction_cannot_open_its_own_frames() {
        let (_, client) = channel_pair();
        let sealed = client.seal("payload").unwrap();
        // The client's recv cipher uses the h2c key; its own frame is c2h.
        assert!(client.open(&sealed).is_err());
    }

    #[test]
    fn a_third_party_cannot_open_frames() {
        let (host, _) = channel_pair();
        let (_, other_client) = channel_pair();
        let sealed = other_client.seal("secret").unwrap();
        assert!(host.open(&sealed).is_err());
    }

    #[test]
    fn room_password_hash_is_stable_and_prefixed() {
        assert_eq!(hash_room_password("pw"), hash_room_password("pw"));
        assert_ne!(hash_room_password("pw"), hash_room_password("pw2"));
        assert_eq!(hash_room_password("pw").len(), 64);
    }
}
