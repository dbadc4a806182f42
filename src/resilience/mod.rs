//! Fault-tolerant execution of outbound operations
//!
//! Provides retry with jittered exponential backoff, per-attempt
//! timeouts, and a three-state circuit breaker per (peer, operation).

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use dashmap::DashMap;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::error::{Error, Result};
use circuit_breaker::Admission;

/// Maximum backoff base between attempts, in seconds
const MAX_BACKOFF_SECS: f64 = 30.0;

/// Per-call knobs for [`FaultExecutor::execute`]
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wall-clock bound per attempt
    pub timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Successful execution outcome
#[derive(Debug)]
pub struct Execution<T> {
    pub value: T,
    pub attempts: u32,
}

/// Failed execution outcome with the last error observed
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: Error,
    pub attempts: u32,
    /// Remaining open window when the circuit gated or tripped
    pub retry_after: Option<Duration>,
}

pub type ExecResult<T> = std::result::Result<Execution<T>, ExecutionFailure>;

/// Snapshot of one circuit's state for metrics and diagnostics
#[derive(Debug, Clone, Copy)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Executor wrapping operations with retry, backoff, timeout and
/// circuit breaking
pub struct FaultExecutor {
    config: CircuitBreakerConfig,
    /// "{peer}:{op_type}" -> breaker
    circuits: DashMap<String, CircuitBreaker>,
}

impl FaultExecutor {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Execute `operation` against `peer_id` with full fault tolerance.
    ///
    /// Admission is checked once per call; each attempt is bounded by
    /// `options.timeout` and a timeout counts as a failure. A
    /// [`Error::Cancelled`] result is recorded as one failure and
    /// returned without further retries.
    pub async fn execute<F, Fut, T>(
        &self,
        peer_id: &str,
        op_type: &str,
        options: ExecuteOptions,
        mut operation: F,
    ) -> ExecResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let circuit_key = format!("{}:{}", peer_id, op_type);

        {
            let mut breaker = self.circuits.entry(circuit_key.clone()).or_default();
            if let Admission::Rejected { retry_after } = breaker.try_acquire(&self.config) {
                log::debug!("Circuit open for {}, rejecting", circuit_key);
                return Err(ExecutionFailure {
                    error: Error::CircuitOpen,
                    attempts: 0,
                    retry_after: Some(retry_after),
                });
            }
        }

        let mut last_error = None;
        let mut attempts = 0;
        for attempt in 0..=options.max_retries {
            attempts = attempt + 1;
            match tokio::time::timeout(options.timeout, operation()).await {
                Ok(Ok(value)) => {
                    self.record_success(&circuit_key);
                    return Ok(Execution { value, attempts });
                }
                Ok(Err(Error::Cancelled)) => {
                    self.record_failure(&circuit_key);
                    return Err(ExecutionFailure {
                        error: Error::Cancelled,
                        attempts,
                        retry_after: None,
                    });
                }
                Ok(Err(e)) => {
                    log::warn!(
                        "{} to {} failed (attempt {}): {}",
                        op_type,
                        peer_id,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                    self.record_failure(&circuit_key);
                }
                Err(_) => {
                    log::warn!("Timeout on {} to {} (attempt {})", op_type, peer_id, attempts);
                    last_error = Some(Error::Timeout(options.timeout));
                    self.record_failure(&circuit_key);
                }
            }

            if attempt < options.max_retries {
                tokio::time::sleep(backoff_delay(attempt, peer_id)).await;
            }
        }

        let retry_after = self
            .circuits
            .get(&circuit_key)
            .and_then(|breaker| breaker.retry_after(&self.config));
        Err(ExecutionFailure {
            error: last_error.unwrap_or_else(|| Error::Network("max retries exceeded".into())),
            attempts,
            retry_after,
        })
    }

    /// Snapshot of the circuit for a (peer, op) pair, if one exists
    pub fn circuit_stats(&self, peer_id: &str, op_type: &str) -> Option<CircuitStats> {
        self.circuits
            .get(&format!("{}:{}", peer_id, op_type))
            .map(|breaker| CircuitStats {
                state: breaker.state(),
                consecutive_failures: breaker.failure_count(),
            })
    }

    fn record_success(&self, circuit_key: &str) {
        if let Some(mut breaker) = self.circuits.get_mut(circuit_key) {
            breaker.record_success(&self.config);
        }
    }

    fn record_failure(&self, circuit_key: &str) {
        if let Some(mut breaker) = self.circuits.get_mut(circuit_key) {
            breaker.record_failure(&self.config);
        }
    }
}

/// Exponential backoff with uniform jitter and a per-peer spreading
/// factor to avoid synchronized retries across nodes.
fn backoff_delay(attempt: u32, peer_id: &str) -> Duration {
    let base = if attempt >= 5 {
        MAX_BACKOFF_SECS
    } else {
        ((1u64 << attempt) as f64).min(MAX_BACKOFF_SECS)
    };
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    let peer_factor = 1.0 + (peer_hash(peer_id) % 100) as f64 / 1000.0;
    Duration::from_secs_f64(base * jitter * peer_factor)
}

fn peer_hash(peer_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    peer_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn executor_with(threshold: u32, timeout: Duration) -> FaultExecutor {
        FaultExecutor::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let executor = FaultExecutor::new(CircuitBreakerConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .execute("peer1", "test_op", ExecuteOptions::default(), move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Network("transient".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        let execution = result.unwrap();
        assert_eq!(execution.value, "done");
        assert_eq!(execution.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = executor.circuit_stats("peer1", "test_op").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn circuit_trips_after_threshold() {
        let executor = executor_with(2, Duration::from_secs(60));
        let options = ExecuteOptions {
            max_retries: 0,
            ..Default::default()
        };

        for _ in 0..2 {
            let failure = executor
                .execute("peer1", "send", options.clone(), || async {
                    Err::<(), _>(Error::Network("down".into()))
                })
                .await
                .unwrap_err();
            assert_eq!(failure.attempts, 1);
            assert!(!matches!(failure.error, Error::CircuitOpen));
        }

        let failure = executor
            .execute("peer1", "send", options, || async {
                Err::<(), _>(Error::Network("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::CircuitOpen));
        assert_eq!(failure.attempts, 0);

        let retry_after = failure.retry_after.unwrap();
        assert!(retry_after > Duration::from_secs(59));
        assert!(retry_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn circuit_recovers_through_half_open() {
        let executor = executor_with(1, Duration::from_millis(50));
        let options = ExecuteOptions {
            max_retries: 0,
            ..Default::default()
        };

        let _ = executor
            .execute("peer1", "send", options.clone(), || async {
                Err::<(), _>(Error::Network("down".into()))
            })
            .await;
        assert_eq!(
            executor.circuit_stats("peer1", "send").unwrap().state,
            CircuitState::Open
        );

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Default success_threshold is 2
        for _ in 0..2 {
            executor
                .execute("peer1", "send", options.clone(), || async { Ok(()) })
                .await
                .unwrap();
        }
        assert_eq!(
            executor.circuit_stats("peer1", "send").unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let executor = Arc::new(executor_with(1, Duration::from_millis(10)));
        let options = ExecuteOptions {
            max_retries: 0,
            ..Default::default()
        };

        let _ = executor
            .execute("peer1", "send", options.clone(), || async {
                Err::<(), _>(Error::Network("down".into()))
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Occupy all three default probe slots with slow operations
        let mut handles = Vec::new();
        for _ in 0..3 {
            let executor = executor.clone();
            let options = options.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .execute("peer1", "send", options, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let failure = executor
            .execute("peer1", "send", options, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::CircuitOpen));

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let executor = FaultExecutor::new(CircuitBreakerConfig::default());
        let options = ExecuteOptions {
            max_retries: 0,
            timeout: Duration::from_millis(50),
        };

        let failure = executor
            .execute("peer1", "slow", options, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::Timeout(_)));
        assert_eq!(failure.attempts, 1);
        assert_eq!(
            executor
                .circuit_stats("peer1", "slow")
                .unwrap()
                .consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn cancellation_is_not_retried() {
        let executor = FaultExecutor::new(CircuitBreakerConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let failure = executor
            .execute("peer1", "op", ExecuteOptions::default(), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Cancelled)
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::Cancelled));
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuits_are_isolated_per_peer_and_op() {
        let executor = executor_with(1, Duration::from_secs(60));
        let options = ExecuteOptions {
            max_retries: 0,
            ..Default::default()
        };

        let _ = executor
            .execute("peer1", "send", options.clone(), || async {
                Err::<(), _>(Error::Network("down".into()))
            })
            .await;

        // Same peer, different op: unaffected
        executor
            .execute("peer1", "ping", options.clone(), || async { Ok(()) })
            .await
            .unwrap();
        // Different peer, same op: unaffected
        executor
            .execute("peer2", "send", options, || async { Ok(()) })
            .await
            .unwrap();
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0, "peer");
        let d5 = backoff_delay(5, "peer");
        assert!(d0 >= Duration::from_secs_f64(0.5));
        assert!(d0 <= Duration::from_secs_f64(1.65));
        assert!(d5 >= Duration::from_secs_f64(15.0));
        assert!(d5 <= Duration::from_secs_f64(49.5));
    }
}
