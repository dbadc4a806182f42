//! Error types and handling for the quantum P2P subsystem

use std::time::Duration;
use thiserror::Error;

/// Result type alias for quantum P2P operations
pub type Result<T> = std::result::Result<T, Error>;

/// Quantum P2P error types
///
/// Crypto failures are deliberately split into distinct variants so the
/// node manager can log and count each kind separately.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown key id: {0}")]
    UnknownKey(String),

    #[error("Replay detected: sequence {sequence} <= watermark {watermark}")]
    Replay { sequence: u64, watermark: u64 },

    #[error("HMAC verification failed")]
    HmacMismatch,

    #[error("AEAD failure: {0}")]
    AeadFailure(String),

    #[error("RNG failure: {0}")]
    Rng(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl Error {
    /// Whether this error is a terminal policy outcome rather than a
    /// transient transport failure. Policy errors are returned to the
    /// caller as-is and never retried.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen | Error::Timeout(_) | Error::Cancelled
        )
    }
}
