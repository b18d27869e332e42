//! Per-agent circuit breaker
//!
//! Stops issuing calls to an agent that keeps failing and periodically
//! lets a single probe through to test recovery. Each failed probe doubles
//! the reset timeout up to a cap.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use relay_core::BreakerConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Too many failures - calls short-circuited until the reset timeout elapses
    Open,
    /// Testing recovery - one probe call allowed
    HalfOpen,
}

/// Why a call was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Breaker open, reset timeout still running
    Open { retry_in: Duration },
    /// Half-open and another caller holds the probe
    ProbeInFlight,
}

/// Result of asking the breaker for permission to call
pub enum Admission {
    Granted(CallPermit),
    Rejected(Rejection),
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    reset_timeout: Duration,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one agent
///
/// # States
///
/// - **Closed**: all calls allowed, consecutive failures counted
/// - **Open**: calls rejected until the reset timeout elapses
/// - **HalfOpen**: exactly one probe in flight at a time
///
/// Every check-and-set happens under one mutex, so two racing callers can
/// never both win the half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    base_timeout: Duration,
    max_timeout: Duration,
}

/// Point-in-time view of a breaker, for introspection
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds since the breaker last opened
    pub opened_ms_ago: Option<u64>,
    pub reset_timeout_ms: u64,
    pub half_open_probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// # Arguments
    ///
    /// * `threshold` - Consecutive failures before opening
    /// * `reset_timeout` - Wait before the first recovery probe
    /// * `max_timeout` - Cap for the doubled timeout after failed probes
    pub fn new(threshold: u32, reset_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                reset_timeout,
                probe_in_flight: false,
            }),
            threshold: threshold.max(1),
            base_timeout: reset_timeout,
            max_timeout: max_timeout.max(reset_timeout),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            config.reset_timeout(),
            config.max_reset_timeout(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for permission to call the agent
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and
    /// grants the caller the probe.
    pub fn try_acquire(self: &Arc<Self>) -> Admission {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Admission::Granted(CallPermit::new(self.clone(), false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(inner.reset_timeout);

                if elapsed >= inner.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Granted(CallPermit::new(self.clone(), true))
                } else {
                    Admission::Rejected(Rejection::Open {
                        retry_in: inner.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected(Rejection::ProbeInFlight)
                } else {
                    inner.probe_in_flight = true;
                    Admission::Granted(CallPermit::new(self.clone(), true))
                }
            }
        }
    }

    /// Current state (an elapsed open breaker still reports open until probed)
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_ms_ago: inner.opened_at.map(|at| at.elapsed().as_millis() as u64),
            reset_timeout_ms: inner.reset_timeout.as_millis() as u64,
            half_open_probe_in_flight: inner.probe_in_flight,
        }
    }

    /// Returns the new state if the call changed it
    fn on_success(&self) -> Option<CircuitState> {
        let mut inner = self.lock();
        let previous = inner.state;

        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.reset_timeout = self.base_timeout;
        inner.probe_in_flight = false;

        (previous != CircuitState::Closed).then_some(CircuitState::Closed)
    }

    fn on_failure(&self, probe: bool) -> Option<CircuitState> {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.reset_timeout = (inner.reset_timeout * 2).min(self.max_timeout);
                inner.probe_in_flight = false;
                Some(CircuitState::Open)
            }
            CircuitState::Closed if inner.consecutive_failures >= self.threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                Some(CircuitState::Open)
            }
            // Late failures from calls admitted before the breaker opened
            _ => None,
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_config(&BreakerConfig::default())
    }
}

/// Permission to make one (retried) call through a breaker
///
/// Settle it with [`record_success`](Self::record_success),
/// [`record_failure`](Self::record_failure) or [`release`](Self::release).
/// Dropping an unsettled probe permit frees the probe slot so a cancelled
/// dispatch cannot wedge the breaker in half-open.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this permit is the half-open recovery probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Reset failures and close the breaker
    pub fn record_success(mut self) -> Option<CircuitState> {
        self.settled = true;
        self.breaker.on_success()
    }

    /// Count a transient failure, possibly opening the breaker
    pub fn record_failure(mut self) -> Option<CircuitState> {
        self.settled = true;
        self.breaker.on_failure(self.probe)
    }

    /// Settle without touching failure counts (permanent failures)
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.release_probe();
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Breakers keyed by agent id, created on first use
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `agent_id`, independent from every other agent's
    pub fn get(&self, agent_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
        {
            return breaker.clone();
        }

        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(&self.config)))
            .clone()
    }

    pub fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.snapshot()))
            .collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
