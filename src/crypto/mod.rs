//! Session crypto engine
//!
//! This module provides:
//! - Per-peer session keys with TTL-based rotation
//! - HKDF-SHA-256 per-message key derivation
//! - AES-256-GCM encryption with the message sequence as AAD
//! - An independent HMAC-SHA-256 integrity tag over the envelope
//! - Monotonic sequence numbers with per-sender replay watermarks
//!
//! Key exchange with remote peers is an external collaborator; the
//! counterpart record arrives via [`SessionCrypto::install_key`].

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::protocol::envelope::{Envelope, NONCE_SIZE, TAG_SIZE};

/// HKDF salt for the integrity key
const HMAC_SALT: &[u8] = b"hmac_salt";

/// HKDF info for the integrity key
const HMAC_INFO: &[u8] = b"quantum_p2p_hmac";

/// Session key shared with one peer
pub struct SessionKey {
    pub key_id: String,
    secret: [u8; 32],
    created_at: Instant,
    /// Outbound sequence counter; never reset for the key's lifetime
    sequence: u64,
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl SessionKey {
    fn generate(key_id: String) -> Result<Self> {
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret).map_err(|e| Error::Rng(e.to_string()))?;
        Ok(Self {
            key_id,
            secret,
            created_at: Instant::now(),
            sequence: 0,
        })
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Encryption engine holding per-peer session keys and replay state
pub struct SessionCrypto {
    node_id: String,
    key_ttl: Duration,
    /// key_id -> session key
    keys: RwLock<HashMap<String, SessionKey>>,
    /// sender node id -> highest accepted inbound sequence
    watermarks: RwLock<HashMap<String, u64>>,
}

impl SessionCrypto {
    pub fn new(node_id: &str, key_ttl: Duration) -> Self {
        Self {
            node_id: node_id.to_string(),
            key_ttl,
            keys: RwLock::new(HashMap::new()),
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    /// Install a session secret under an explicit key identifier.
    ///
    /// Used by the key-exchange collaborator to seed both sides of a
    /// session. Replaces any existing record and resets its counter.
    pub async fn install_key(&self, key_id: &str, secret: [u8; 32]) {
        let key = SessionKey {
            key_id: key_id.to_string(),
            secret,
            created_at: Instant::now(),
            sequence: 0,
        };
        self.keys.write().await.insert(key_id.to_string(), key);
        log::info!("Installed session key {}", key_id);
    }

    /// Encrypt a plaintext for a peer, producing a wire envelope.
    ///
    /// Looks up or creates the session key; a TTL-expired key is rotated
    /// in place (fresh secret, counter reset). The whole operation runs
    /// under the key-table write lock with no suspension points, so the
    /// (sequence, nonce) pair is emitted atomically per peer.
    pub async fn encrypt(&self, plaintext: &[u8], peer_id: &str) -> Result<Envelope> {
        let key_id = format!("{}:{}", self.node_id, peer_id);
        let mut keys = self.keys.write().await;

        let needs_new = match keys.get(&key_id) {
            Some(key) => key.is_expired(self.key_ttl),
            None => true,
        };
        if needs_new {
            keys.insert(key_id.clone(), SessionKey::generate(key_id.clone())?);
            log::info!("Created session key for peer {}", peer_id);
        }
        let key = keys
            .get_mut(&key_id)
            .ok_or_else(|| Error::UnknownKey(key_id.clone()))?;

        key.sequence += 1;
        let sequence = key.sequence;
        let seq_be = sequence.to_be_bytes();

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).map_err(|e| Error::Rng(e.to_string()))?;

        let info = format!("{}:{}", self.node_id, peer_id);
        let mut message_key = derive_key(&key.secret, Some(&nonce), info.as_bytes())?;

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| Error::AeadFailure(e.to_string()))?;
        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &seq_be,
                },
            )
            .map_err(|_| Error::AeadFailure("encryption failed".into()))?;
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);
        let ciphertext = sealed;

        let mut hmac_key = derive_key(&key.secret, Some(HMAC_SALT), HMAC_INFO)?;
        let hmac = compute_hmac(&hmac_key, &nonce, &seq_be, &ciphertext, &tag)?;

        message_key.zeroize();
        hmac_key.zeroize();

        Ok(Envelope {
            nonce: nonce.to_vec(),
            ciphertext,
            tag,
            sequence,
            key_id,
            hmac,
        })
    }

    /// Verify and decrypt an inbound envelope from `sender_id`.
    ///
    /// Order of checks: schema, key lookup, replay watermark, HMAC
    /// (constant-time), then GCM tag verification. The watermark only
    /// advances once everything has verified.
    pub async fn decrypt(&self, envelope: &Envelope, sender_id: &str) -> Result<Vec<u8>> {
        envelope.validate()?;

        let keys = self.keys.read().await;
        let key = keys
            .get(&envelope.key_id)
            .ok_or_else(|| Error::UnknownKey(envelope.key_id.clone()))?;

        // Cheap rejection before any crypto work
        let watermark = self
            .watermarks
            .read()
            .await
            .get(sender_id)
            .copied()
            .unwrap_or(0);
        if envelope.sequence <= watermark {
            return Err(Error::Replay {
                sequence: envelope.sequence,
                watermark,
            });
        }

        let seq_be = envelope.sequence.to_be_bytes();
        let mut hmac_key = derive_key(&key.secret, Some(HMAC_SALT), HMAC_INFO)?;
        let expected = compute_hmac(
            &hmac_key,
            &envelope.nonce,
            &seq_be,
            &envelope.ciphertext,
            &envelope.tag,
        )?;
        hmac_key.zeroize();
        if !bool::from(expected.ct_eq(&envelope.hmac[..])) {
            return Err(Error::HmacMismatch);
        }

        let info = format!("{}:{}", sender_id, self.node_id);
        let mut message_key = derive_key(&key.secret, Some(&envelope.nonce), info.as_bytes())?;

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| Error::AeadFailure(e.to_string()))?;
        let mut combined = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(&envelope.ciphertext);
        combined.extend_from_slice(&envelope.tag);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &combined,
                    aad: &seq_be,
                },
            )
            .map_err(|_| Error::AeadFailure("authentication failed".into()))?;
        message_key.zeroize();
        drop(keys);

        // Re-check under the write lock: out-of-order delivery above the
        // watermark is accepted, the watermark jumps to the highest seen.
        let mut watermarks = self.watermarks.write().await;
        let entry = watermarks.entry(sender_id.to_string()).or_insert(0);
        if envelope.sequence <= *entry {
            return Err(Error::Replay {
                sequence: envelope.sequence,
                watermark: *entry,
            });
        }
        *entry = envelope.sequence;

        Ok(plaintext)
    }

    /// Highest accepted inbound sequence for a sender (0 if none)
    pub async fn watermark(&self, sender_id: &str) -> u64 {
        self.watermarks
            .read()
            .await
            .get(sender_id)
            .copied()
            .unwrap_or(0)
    }
}

/// HKDF-SHA-256 into a 32-byte key
fn derive_key(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::AeadFailure("key derivation failed".into()))?;
    Ok(okm)
}

/// HMAC-SHA-256 over nonce || sequence || ciphertext || gcm_tag
fn compute_hmac(
    key: &[u8],
    nonce: &[u8],
    seq_be: &[u8; 8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| Error::AeadFailure(e.to_string()))?;
    mac.update(nonce);
    mac.update(seq_be);
    mac.update(ciphertext);
    mac.update(tag);
    Ok(mac.finalize().into_bytes().to_vec())
}
