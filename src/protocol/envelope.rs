//! Encrypted on-wire envelope
//!
//! The envelope is the interoperability boundary: a JSON object with
//! byte fields encoded as lowercase hex. Unknown fields and malformed
//! hex lengths are rejected before any cryptographic work happens.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Nonce size for AES-256-GCM (12 bytes, 24 hex chars)
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag size (16 bytes, 32 hex chars)
pub const TAG_SIZE: usize = 16;

/// HMAC-SHA-256 output size (32 bytes, 64 hex chars)
pub const HMAC_SIZE: usize = 32;

/// Encrypted envelope carried inside each wire frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub tag: Vec<u8>,
    pub sequence: u64,
    /// Session key identifier, "{sender}:{receiver}"
    pub key_id: String,
    #[serde(with = "hex_bytes")]
    pub hmac: Vec<u8>,
}

impl Envelope {
    /// Enforce the wire schema: fixed hex lengths and sequence >= 1
    pub fn validate(&self) -> Result<()> {
        if self.nonce.len() != NONCE_SIZE {
            return Err(Error::Protocol(format!(
                "invalid nonce length: {}",
                self.nonce.len()
            )));
        }
        if self.tag.len() != TAG_SIZE {
            return Err(Error::Protocol(format!(
                "invalid tag length: {}",
                self.tag.len()
            )));
        }
        if self.hmac.len() != HMAC_SIZE {
            return Err(Error::Protocol(format!(
                "invalid hmac length: {}",
                self.hmac.len()
            )));
        }
        if self.sequence == 0 {
            return Err(Error::Protocol("sequence must be >= 1".into()));
        }
        if self.key_id.is_empty() {
            return Err(Error::Protocol("empty key_id".into()));
        }
        Ok(())
    }

    /// Sender node id, recovered from the key identifier
    pub fn sender(&self) -> Option<&str> {
        self.key_id.split_once(':').map(|(sender, _)| sender)
    }
}

/// Serde adapter: byte vectors as lowercase hex strings
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
