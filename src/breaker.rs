//! Circuit breaker for the provider path
//!
//! Counts consecutive transient failures; opens after a configurable
//! threshold, fails fast during the cooldown, then admits a single probe
//! in half-open. Permanent (4xx) errors indicate configuration problems,
//! not a flapping dependency, and never count.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Externally observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// What the breaker says about one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Circuit closed; proceed normally.
    Pass,
    /// This request is the single half-open probe.
    Probe,
    /// Fail fast with `circuit_open`.
    FastFail,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Gate one request against the current clock.
    pub fn check(&self) -> Gate {
        self.check_at(Instant::now())
    }

    /// Gate one request at an explicit instant, for tests.
    pub fn check_at(&self, now: Instant) -> Gate {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => Gate::Pass,
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.cooldown);
                if cooled {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    Gate::Probe
                } else {
                    Gate::FastFail
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Gate::FastFail
                } else {
                    state.probe_in_flight = true;
                    Gate::Probe
                }
            }
        }
    }

    /// Record a successful provider call.
    pub fn on_success(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    /// Record a breaker-counted failure (transient, timeout, or parse).
    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    pub fn on_failure_at(&self, now: Instant) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed; back to open with a fresh cooldown.
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.probe_in_flight = false;
            }
            CircuitState::Open => {
                state.opened_at = Some(now);
            }
        }
    }

    /// Release the half-open probe slot after an outcome that counts
    /// neither as success nor failure (permanent or remotely
    /// rate-limited), so the next request can probe again.
    pub fn release_probe(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen {
            state.probe_in_flight = false;
        }
    }

    /// Read-only state accessor for tests and the stats surface.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
