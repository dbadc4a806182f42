//! Protocol-level message types
//!
//! This module provides:
//! - The cleartext message record exchanged between nodes
//! - Well-known message type tags
//! - The encrypted on-wire envelope (see [`envelope`])

pub mod envelope;

pub use envelope::Envelope;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Default message time-to-live (5 minutes)
pub const DEFAULT_MESSAGE_TTL: f64 = 300.0;

/// Well-known message type tags. Callers may register handlers for
/// additional types; unknown inbound types are dropped.
pub mod message_types {
    pub const INFERENCE_REQUEST: &str = "inference_request";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PEER_DISCOVERY: &str = "peer_discovery";
    pub const DATA_SYNC: &str = "data_sync";
}

/// Cleartext P2P message, serialized as UTF-8 JSON before encryption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pMessage {
    /// Random 16-byte identifier, lowercase hex (32 chars)
    pub message_id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub sender_id: String,
    pub data: serde_json::Value,
    /// UNIX timestamp in float seconds
    pub timestamp: f64,
    /// Time-to-live in seconds; receivers drop expired messages
    pub ttl: f64,
}

impl P2pMessage {
    /// Compose a new message with a fresh random identifier
    pub fn new(msg_type: &str, sender_id: &str, data: serde_json::Value) -> Result<Self> {
        let mut id_bytes = [0u8; 16];
        getrandom::getrandom(&mut id_bytes).map_err(|e| Error::Rng(e.to_string()))?;

        Ok(Self {
            message_id: hex::encode(id_bytes),
            msg_type: msg_type.to_string(),
            sender_id: sender_id.to_string(),
            data,
            timestamp: unix_time(),
            ttl: DEFAULT_MESSAGE_TTL,
        })
    }

    /// Serialize to the cleartext wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from the cleartext wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Whether the message has outlived its TTL
    pub fn is_expired(&self) -> bool {
        unix_time() - self.timestamp > self.ttl
    }
}

/// Current UNIX time in float seconds
pub(crate) fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
