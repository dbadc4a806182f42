//! Circuit breaker state machine
//!
//! One breaker exists per (peer, operation) key. Breakers are plain
//! state mutated under the owning table's lock, so transitions are
//! observed in a total order per key.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, reject requests until the open window elapses
    Open,
    /// Testing recovery with a bounded number of probes
    HalfOpen,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Maximum concurrent probes while half-open
    pub half_open_max_calls: u32,
    /// Consecutive successes to close from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("circuit timeout must be positive".into()));
        }
        if self.half_open_max_calls == 0 {
            return Err(Error::Config("half_open_max_calls must be positive".into()));
        }
        if self.success_threshold == 0 {
            return Err(Error::Config("success_threshold must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of asking the breaker to admit an execution
#[derive(Debug)]
pub(crate) enum Admission {
    Permitted,
    Rejected { retry_after: Duration },
}

/// Per-(peer, operation) breaker state
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
    success_count: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_in_flight: 0,
            success_count: 0,
        }
    }
}

impl CircuitBreaker {
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Gate an execution. An admitted call in half-open occupies one
    /// probe slot until its outcome is recorded.
    pub(crate) fn try_acquire(&mut self, config: &CircuitBreakerConfig) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Permitted,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(config.timeout);
                if elapsed >= config.timeout {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    // This call takes the first probe slot
                    self.half_open_in_flight = 1;
                    log::info!("Circuit breaker transitioned to half-open");
                    Admission::Permitted
                } else {
                    Admission::Rejected {
                        retry_after: config.timeout - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight < config.half_open_max_calls {
                    self.half_open_in_flight += 1;
                    Admission::Permitted
                } else {
                    Admission::Rejected {
                        retry_after: Duration::ZERO,
                    }
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self, config: &CircuitBreakerConfig) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.half_open_in_flight = 0;
                    log::info!("Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub(crate) fn record_failure(&mut self, config: &CircuitBreakerConfig) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= config.failure_threshold {
                    self.state = CircuitState::Open;
                    log::warn!(
                        "Circuit breaker opened after {} failures",
                        self.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure sends the circuit back to open
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.state = CircuitState::Open;
                log::warn!("Circuit breaker reopened by half-open failure");
            }
            CircuitState::Open => {}
        }
    }

    /// Remaining open window, when the circuit is open
    pub(crate) fn retry_after(&self, config: &CircuitBreakerConfig) -> Option<Duration> {
        if self.state == CircuitState::Open {
            let elapsed = self
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or_default();
            Some(config.timeout.saturating_sub(elapsed))
        } else {
            None
        }
    }
}
