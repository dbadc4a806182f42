//! Peer discovery collaborator interface
//!
//! Discovery itself (DHT, rendezvous, etc.) lives outside this crate;
//! the node manager only needs a way to turn a peer id into a connected
//! stream. [`StaticDiscovery`] serves fixed topologies and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Resolves a peer id to a connected transport stream
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover(&self, peer_id: &str) -> Result<TcpStream>;
}

/// Discovery backed by a fixed peer-to-address table
#[derive(Default)]
pub struct StaticDiscovery {
    peers: RwLock<HashMap<String, SocketAddr>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_peer(&self, peer_id: &str, addr: SocketAddr) {
        self.peers.write().await.insert(peer_id.to_string(), addr);
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn discover(&self, peer_id: &str) -> Result<TcpStream> {
        let addr = self
            .peers
            .read()
            .await
            .get(peer_id)
            .copied()
            .ok_or_else(|| Error::Network(format!("no known address for peer {}", peer_id)))?;

        TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Network(format!("connect to {} failed: {}", peer_id, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let discovery = StaticDiscovery::new();
        assert!(discovery.discover("nobody").await.is_err());
    }

    #[tokio::test]
    async fn connects_to_registered_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let discovery = StaticDiscovery::new();
        discovery.add_peer("peer1", addr).await;

        let (stream, accepted) = tokio::join!(discovery.discover("peer1"), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }
}
