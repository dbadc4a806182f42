//! Adaptive routing table
//!
//! Maintains exponentially-smoothed per-peer latency, bandwidth and
//! success-rate metrics and produces a scored next-hop decision with a
//! confidence value. Multi-hop paths are advisory; transmission is
//! always direct one-hop.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tokio::sync::RwLock;

/// EMA smoothing factor for latency and bandwidth
const EMA_ALPHA: f64 = 0.3;

/// Sliding window length for the success rate
const SUCCESS_WINDOW: usize = 100;

/// Score age decay constant (seconds)
const SCORE_AGE_DECAY_SECS: f64 = 300.0;

/// Confidence age decay constant (seconds)
const CONFIDENCE_AGE_DECAY_SECS: f64 = 600.0;

/// Neutral score for peers with no recorded metrics
const DEFAULT_SCORE: f64 = 50.0;

/// Latency assumed for peers with no recorded metrics (ms)
const DEFAULT_LATENCY_MS: f64 = 100.0;

/// Latency estimate for the second hop of a relayed path (ms)
const HOP_LATENCY_MS: f64 = 50.0;

/// Observed performance metrics for one peer
#[derive(Debug, Clone)]
pub struct RouteMetrics {
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub success_rate: f64,
    pub last_updated: Instant,
}

/// Next-hop decision with confidence scoring
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Proposed path, starting at this node; empty when no peers exist
    pub path: Vec<String>,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub estimated_latency_ms: f64,
    pub reason: String,
}

/// Per-peer metric store and route selector
pub struct AdaptiveRouter {
    node_id: String,
    metrics: RwLock<HashMap<String, RouteMetrics>>,
    history: RwLock<HashMap<String, VecDeque<bool>>>,
}

impl AdaptiveRouter {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            metrics: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Record an observation for a peer.
    ///
    /// Latency and bandwidth are smoothed with EMA; the success rate is
    /// the mean over the last [`SUCCESS_WINDOW`] outcomes.
    pub async fn record(&self, peer_id: &str, latency_ms: f64, bandwidth_mbps: f64, success: bool) {
        let mut history = self.history.write().await;
        let window = history
            .entry(peer_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(SUCCESS_WINDOW));
        if window.len() == SUCCESS_WINDOW {
            window.pop_front();
        }
        window.push_back(success);
        let success_rate = window.iter().filter(|ok| **ok).count() as f64 / window.len() as f64;
        drop(history);

        let mut metrics = self.metrics.write().await;
        match metrics.get_mut(peer_id) {
            Some(existing) => {
                existing.latency_ms = ema(latency_ms, existing.latency_ms);
                existing.bandwidth_mbps = ema(bandwidth_mbps, existing.bandwidth_mbps);
                existing.success_rate = success_rate;
                existing.last_updated = Instant::now();
            }
            None => {
                metrics.insert(
                    peer_id.to_string(),
                    RouteMetrics {
                        latency_ms,
                        bandwidth_mbps,
                        success_rate,
                        last_updated: Instant::now(),
                    },
                );
            }
        }
        log::debug!(
            "Updated metrics for {}: latency={}ms success_rate={:.2}",
            peer_id,
            latency_ms,
            success_rate
        );
    }

    /// Select the next hop towards `target` among `candidates`.
    pub async fn select(&self, target: &str, candidates: &[String]) -> RouteDecision {
        if candidates.is_empty() {
            return RouteDecision {
                path: Vec::new(),
                confidence: 0.0,
                estimated_latency_ms: f64::INFINITY,
                reason: "no_peers_available".into(),
            };
        }

        let metrics = self.metrics.read().await;

        if candidates.iter().any(|c| c == target) {
            let (confidence, latency) = match metrics.get(target) {
                Some(m) => (direct_confidence(m), m.latency_ms),
                None => (DEFAULT_SCORE / 100.0, DEFAULT_LATENCY_MS),
            };
            return RouteDecision {
                path: vec![self.node_id.clone(), target.to_string()],
                confidence,
                estimated_latency_ms: latency,
                reason: "direct_route_optimal".into(),
            };
        }

        let mut scored: Vec<(f64, Option<Instant>, &String)> = candidates
            .iter()
            .map(|peer| {
                let m = metrics.get(peer);
                (peer_score(m), m.map(|m| m.last_updated), peer)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(b.2))
        });

        let (best_score, _, best_peer) = &scored[0];
        let relay_latency = metrics
            .get(*best_peer)
            .map(|m| m.latency_ms)
            .unwrap_or(DEFAULT_LATENCY_MS);

        RouteDecision {
            path: vec![
                self.node_id.clone(),
                (*best_peer).clone(),
                target.to_string(),
            ],
            confidence: (best_score / 100.0).min(1.0),
            estimated_latency_ms: relay_latency + HOP_LATENCY_MS,
            reason: format!("best_peer_{}_score_{:.2}", best_peer, best_score),
        }
    }

    /// Current metrics for a peer, if any have been recorded
    pub async fn metrics_for(&self, peer_id: &str) -> Option<RouteMetrics> {
        self.metrics.read().await.get(peer_id).cloned()
    }
}

fn ema(observed: f64, prior: f64) -> f64 {
    EMA_ALPHA * observed + (1.0 - EMA_ALPHA) * prior
}

/// Age-discounted 0-100 score for a peer
fn peer_score(metrics: Option<&RouteMetrics>) -> f64 {
    let Some(m) = metrics else {
        return DEFAULT_SCORE;
    };
    let age_factor = (-m.last_updated.elapsed().as_secs_f64() / SCORE_AGE_DECAY_SECS).exp();
    let latency_score = (100.0 - m.latency_ms / 10.0).max(0.0);
    let bandwidth_score = (m.bandwidth_mbps * 2.0).min(100.0);
    let reliability_score = m.success_rate * 100.0;
    age_factor * (0.4 * latency_score + 0.3 * bandwidth_score + 0.3 * reliability_score)
}

/// Confidence for a known direct peer, 0-1.
///
/// Uses the same weighted blend as [`peer_score`], normalized to 0-1,
/// with a slower age decay.
fn direct_confidence(m: &RouteMetrics) -> f64 {
    let age_factor = (-m.last_updated.elapsed().as_secs_f64() / CONFIDENCE_AGE_DECAY_SECS).exp();
    let latency_score = (100.0 - m.latency_ms / 10.0).max(0.0);
    let bandwidth_score = (m.bandwidth_mbps * 2.0).min(100.0);
    let reliability_score = m.success_rate * 100.0;
    let performance =
        (0.4 * latency_score + 0.3 * bandwidth_score + 0.3 * reliability_score) / 100.0;
    (age_factor * performance).min(1.0)
}
