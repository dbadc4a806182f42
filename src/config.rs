//! Node configuration
//!
//! All options are optional with production defaults; invalid values are
//! rejected at node construction, not at first use.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::resilience::CircuitBreakerConfig;

/// Configuration for a P2P node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TCP port to bind; 0 lets the OS assign one
    pub bind_port: u16,
    /// Session key lifetime before rotation
    pub aead_key_ttl: Duration,
    /// Circuit breaker thresholds, shared by all (peer, op) circuits
    pub circuit: CircuitBreakerConfig,
    /// Period of the heartbeat emitter task
    pub heartbeat_interval: Duration,
    /// Period of the stale-peer sweeper task
    pub peer_cleanup_interval: Duration,
    /// Peers idle longer than this are disconnected by the sweeper
    pub peer_stale_timeout: Duration,
    /// Maximum size of a single wire frame
    pub max_frame_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_port: 0,
            aead_key_ttl: Duration::from_secs(3600),
            circuit: CircuitBreakerConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            peer_cleanup_interval: Duration::from_secs(60),
            peer_stale_timeout: Duration::from_secs(300),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.aead_key_ttl.is_zero() {
            return Err(Error::Config("aead_key_ttl must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat_interval must be positive".into()));
        }
        if self.peer_cleanup_interval.is_zero() {
            return Err(Error::Config(
                "peer_cleanup_interval must be positive".into(),
            ));
        }
        if self.peer_stale_timeout.is_zero() {
            return Err(Error::Config("peer_stale_timeout must be positive".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config("max_frame_bytes must be positive".into()));
        }
        self.circuit.validate()
    }
}
