//! P2P node manager
//!
//! Composes the session crypto engine, the fault executor and the
//! adaptive routing table behind a single node object that accepts
//! inbound connections, frames and dispatches encrypted envelopes, and
//! exposes one `send` operation:
//! route (advisory) -> encrypt -> execute with fault tolerance ->
//! record performance metrics.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::crypto::SessionCrypto;
use crate::discovery::PeerDiscovery;
use crate::error::Result;
use crate::protocol::{self, message_types, Envelope, P2pMessage};
use crate::resilience::{ExecResult, ExecuteOptions, ExecutionFailure, FaultExecutor};
use crate::routing::AdaptiveRouter;
use crate::transport;

/// Bandwidth estimate recorded for successful sends (Mbps)
const ESTIMATED_BANDWIDTH_MBPS: f64 = 100.0;

/// Handler invoked for each decrypted inbound message of its type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: P2pMessage, sender_id: &str);
}

/// Outbound connection state for one peer
struct PeerConnection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    connected_at: Instant,
    last_seen: Instant,
}

#[derive(Default)]
struct NodeCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    encryption_successes: AtomicU64,
    encryption_failures: AtomicU64,
}

/// Snapshot of node-level metrics
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub node_id: String,
    pub running: bool,
    pub connected_peers: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub encryption_success_rate: f64,
    pub bind_port: u16,
}

/// P2P node composing crypto, fault tolerance and routing.
///
/// Cheap to clone; all state is shared. Subsystems hold no reference
/// back to the manager.
#[derive(Clone)]
pub struct NodeManager {
    node_id: String,
    config: NodeConfig,
    crypto: Arc<SessionCrypto>,
    routing: Arc<AdaptiveRouter>,
    executor: Arc<FaultExecutor>,
    discovery: Arc<dyn PeerDiscovery>,
    peers: Arc<RwLock<HashMap<String, PeerConnection>>>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MessageHandler>>>>,
    counters: Arc<NodeCounters>,
    running: Arc<AtomicBool>,
    bind_port: Arc<AtomicU16>,
    shutdown: Arc<Mutex<Option<watch::Sender<bool>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl NodeManager {
    pub fn new(
        node_id: &str,
        config: NodeConfig,
        discovery: Arc<dyn PeerDiscovery>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            node_id: node_id.to_string(),
            crypto: Arc::new(SessionCrypto::new(node_id, config.aead_key_ttl)),
            routing: Arc::new(AdaptiveRouter::new(node_id)),
            executor: Arc::new(FaultExecutor::new(config.circuit.clone())),
            discovery,
            peers: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(NodeCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            bind_port: Arc::new(AtomicU16::new(0)),
            shutdown: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            conn_tasks: Arc::new(Mutex::new(Vec::new())),
            config,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn bind_port(&self) -> u16 {
        self.bind_port.load(Ordering::SeqCst)
    }

    /// Session crypto engine, exposed for external key installation
    pub fn crypto(&self) -> &SessionCrypto {
        &self.crypto
    }

    /// Adaptive routing table
    pub fn routing(&self) -> &AdaptiveRouter {
        &self.routing
    }

    /// Register (or replace) the handler for a message type
    pub async fn register_handler(&self, msg_type: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .await
            .insert(msg_type.to_string(), handler);
    }

    /// Bind the listener and spawn background tasks. Idempotent.
    pub async fn start(&self) -> Result<bool> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(true);
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.bind_port)).await?;
        let port = listener.local_addr()?.port();
        self.bind_port.store(port, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);
        self.running.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            self.clone().accept_loop(listener, shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            self.clone().heartbeat_loop(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(self.clone().cleanup_loop(shutdown_rx)));
        drop(tasks);

        log::info!("P2P node {} listening on port {}", self.node_id, port);
        Ok(true)
    }

    /// Signal shutdown, join background tasks and close peer writers
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(shutdown_tx) = self.shutdown.lock().await.take() {
            let _ = shutdown_tx.send(true);
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        for task in self.conn_tasks.lock().await.drain(..) {
            task.abort();
            let _ = task.await;
        }

        let mut peers = self.peers.write().await;
        for (peer_id, conn) in peers.drain() {
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
            log::info!("Disconnected from peer {}", peer_id);
        }

        log::info!("P2P node {} stopped", self.node_id);
    }

    /// Send an encrypted message to a peer.
    ///
    /// Returns the fault executor's result; encryption and connection
    /// failures surface as a failure with zero attempts.
    pub async fn send(
        &self,
        target: &str,
        msg_type: &str,
        data: serde_json::Value,
        timeout: Duration,
    ) -> ExecResult<()> {
        let candidates: Vec<String> = self.peers.read().await.keys().cloned().collect();
        let decision = self.routing.select(target, &candidates).await;
        log::debug!(
            "Route to {}: {:?} ({})",
            target,
            decision.path,
            decision.reason
        );

        let plaintext = match P2pMessage::new(msg_type, &self.node_id, data)
            .and_then(|message| message.to_bytes())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(ExecutionFailure {
                    error: e,
                    attempts: 0,
                    retry_after: None,
                })
            }
        };

        let envelope = match self.crypto.encrypt(&plaintext, target).await {
            Ok(envelope) => {
                self.counters
                    .encryption_successes
                    .fetch_add(1, Ordering::Relaxed);
                envelope
            }
            Err(e) => {
                self.counters
                    .encryption_failures
                    .fetch_add(1, Ordering::Relaxed);
                log::error!("Encryption for {} failed: {}", target, e);
                return Err(ExecutionFailure {
                    error: e,
                    attempts: 0,
                    retry_after: None,
                });
            }
        };

        let writer = match self.connection_to(target).await {
            Ok(writer) => writer,
            Err(e) => {
                log::warn!("Cannot reach {}: {}", target, e);
                return Err(ExecutionFailure {
                    error: e,
                    attempts: 0,
                    retry_after: None,
                });
            }
        };

        let started = Instant::now();
        let max_frame_bytes = self.config.max_frame_bytes;
        let options = ExecuteOptions {
            timeout,
            ..Default::default()
        };
        let result = self
            .executor
            .execute(target, "send_message", options, || {
                let writer = writer.clone();
                let envelope = envelope.clone();
                async move {
                    let mut guard = writer.lock().await;
                    transport::write_frame(&mut *guard, &envelope, max_frame_bytes).await
                }
            })
            .await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.touch_peer(target).await;
                self.routing
                    .record(target, latency_ms, ESTIMATED_BANDWIDTH_MBPS, true)
                    .await;
            }
            Err(failure) => {
                log::warn!(
                    "Send to {} failed after {} attempts: {}",
                    target,
                    failure.attempts,
                    failure.error
                );
                self.routing
                    .record(target, latency_ms, ESTIMATED_BANDWIDTH_MBPS, false)
                    .await;
            }
        }
        result
    }

    /// Current node metrics
    pub async fn metrics(&self) -> NodeMetrics {
        let successes = self.counters.encryption_successes.load(Ordering::Relaxed);
        let failures = self.counters.encryption_failures.load(Ordering::Relaxed);
        let attempts = successes + failures;
        let encryption_success_rate = if attempts == 0 {
            1.0
        } else {
            successes as f64 / attempts as f64
        };

        NodeMetrics {
            node_id: self.node_id.clone(),
            running: self.is_running(),
            connected_peers: self.peers.read().await.len(),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            encryption_success_rate,
            bind_port: self.bind_port(),
        }
    }

    /// Writer for a peer, connecting through discovery when absent
    async fn connection_to(&self, peer_id: &str) -> Result<Arc<Mutex<OwnedWriteHalf>>> {
        if let Some(conn) = self.peers.read().await.get(peer_id) {
            return Ok(conn.writer.clone());
        }

        log::info!("No connection to {}, invoking discovery", peer_id);
        let stream = self.discovery.discover(peer_id).await?;
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        let now = Instant::now();
        self.peers.write().await.insert(
            peer_id.to_string(),
            PeerConnection {
                writer: writer.clone(),
                connected_at: now,
                last_seen: now,
            },
        );

        // Responses arrive on the same stream
        let handle = tokio::spawn(self.clone().read_loop(read_half));
        self.conn_tasks.lock().await.push(handle);

        Ok(writer)
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::info!("New peer connection from {}", addr);
                        let (read_half, _write_half) = stream.into_split();
                        let handle = tokio::spawn(self.clone().read_loop(read_half));
                        self.conn_tasks.lock().await.push(handle);
                    }
                    Err(e) => {
                        log::error!("Accept failed: {}", e);
                    }
                }
            }
        }
    }

    /// Read frames off a stream until it closes or violates the protocol
    async fn read_loop<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            match transport::read_frame(&mut reader, self.config.max_frame_bytes).await {
                Ok(Some(envelope)) => self.process_envelope(envelope).await,
                Ok(None) => {
                    log::info!("Peer connection closed");
                    break;
                }
                Err(e) => {
                    log::warn!("Framing error, closing connection: {}", e);
                    break;
                }
            }
        }
    }

    /// Decrypt an inbound envelope and dispatch it to its handler.
    /// Crypto failures drop the message but keep the connection open.
    async fn process_envelope(&self, envelope: Envelope) {
        let Some(sender_id) = envelope.sender().map(str::to_string) else {
            log::warn!("Envelope with malformed key id: {}", envelope.key_id);
            return;
        };

        let plaintext = match self.crypto.decrypt(&envelope, &sender_id).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("Failed to decrypt message from {}: {}", sender_id, e);
                return;
            }
        };

        let message = match P2pMessage::from_bytes(&plaintext) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Malformed cleartext from {}: {}", sender_id, e);
                return;
            }
        };

        if message.is_expired() {
            log::debug!(
                "Dropping expired message {} from {}",
                message.message_id,
                sender_id
            );
            return;
        }

        self.counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        self.touch_peer(&sender_id).await;

        let handler = self.handlers.read().await.get(&message.msg_type).cloned();
        match handler {
            Some(handler) => handler.handle(message, &sender_id).await,
            None => log::debug!("No handler for message type {}", message.msg_type),
        }
    }

    async fn heartbeat_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let peers: Vec<String> = self.peers.read().await.keys().cloned().collect();
                    for peer_id in peers {
                        let data = serde_json::json!({ "timestamp": protocol::unix_time() });
                        if let Err(failure) = self
                            .send(&peer_id, message_types::HEARTBEAT, data, Duration::from_secs(10))
                            .await
                        {
                            log::warn!("Heartbeat to {} failed: {}", peer_id, failure.error);
                        }
                    }
                }
            }
        }
    }

    async fn cleanup_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.peer_cleanup_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let stale: Vec<String> = self
                        .peers
                        .read()
                        .await
                        .iter()
                        .filter(|(_, conn)| conn.last_seen.elapsed() > self.config.peer_stale_timeout)
                        .map(|(peer_id, _)| peer_id.clone())
                        .collect();
                    for peer_id in stale {
                        self.disconnect_peer(&peer_id).await;
                    }
                }
            }
        }
    }

    async fn disconnect_peer(&self, peer_id: &str) {
        if let Some(conn) = self.peers.write().await.remove(peer_id) {
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
            let connected_for = conn.connected_at.elapsed();
            log::info!(
                "Disconnected stale peer {} (connected {:?})",
                peer_id,
                connected_for
            );
        }
    }

    async fn touch_peer(&self, peer_id: &str) {
        if let Some(conn) = self.peers.write().await.get_mut(peer_id) {
            conn.last_seen = Instant::now();
        }
    }
}
