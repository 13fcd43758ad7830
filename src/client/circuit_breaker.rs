//! Circuit breaker around the client's retry loop.
//!
//! - Closed: calls flow; consecutive failures are counted
//! - Open: calls are refused until the cool-down elapses
//! - Half-open: a single trial call decides between Closed and Open

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time spent open before a trial call is allowed
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, moving Open to HalfOpen once the cool-down is over
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_cool_down(&mut inner);
        inner.state
    }

    /// Consecutive failures counted while closed
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Whether a call may proceed; in half-open only one caller gets through
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.check_cool_down(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen if inner.trial_in_flight => false,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(from = %inner.state, "Circuit breaker closing");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    warn!(failures = inner.failures, "Circuit breaker opening");
                    Self::open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Trial call failed, circuit breaker re-opening");
                Self::open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Outcome that says nothing about the remote's health.
    ///
    /// Frees the half-open trial slot without changing state or counts.
    pub fn record_ignored(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
    }

    fn open(inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
    }

    fn check_cool_down(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.cool_down);
        if cooled {
            debug!("Circuit breaker cool-down over, allowing a trial call");
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
