//! Circuit breaker for assignment targets
//!
//! Guards the act of handing work to a worker. Repeated failures trip the
//! circuit so the scheduler fails fast instead of burning the retry budget
//! of every queued task against a dead target.
//!
//! # States
//!
//! - **Closed**: attempts allowed; failures counted within a rolling window
//! - **Open**: attempts rejected until the cool-down elapses
//! - **HalfOpen**: exactly one trial attempt allowed; success closes the
//!   circuit, failure re-opens it with an increased cool-down

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use drover_core::CircuitConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::backoff::jittered_ms;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-target circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    /// Failure timestamps within the rolling window
    failures: VecDeque<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
    /// Consecutive trips without an intervening success; drives the
    /// exponential cool-down growth
    trips: u32,
    probe_in_flight: bool,
}

/// Serializable circuit state for engine snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: Vec<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub trips: u32,
    pub probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            open_until: None,
            trips: 0,
            probe_in_flight: false,
        }
    }

    /// Effective state, accounting for an elapsed cool-down
    pub fn state(&self) -> CircuitState {
        match self.state {
            CircuitState::Open if self.cooldown_elapsed() => CircuitState::HalfOpen,
            s => s,
        }
    }

    /// Whether an assignment attempt may proceed right now
    ///
    /// In half-open state this admits exactly one trial; further calls are
    /// rejected until the trial's outcome is recorded.
    pub fn try_acquire(&mut self) -> bool {
        self.refresh();
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful attempt: close the circuit and reset counters
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.open_until = None;
        self.trips = 0;
        self.probe_in_flight = false;
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self) {
        self.refresh();
        match self.state {
            CircuitState::HalfOpen => {
                // The trial failed: back to open with a longer cool-down
                self.trip();
            }
            CircuitState::Closed => {
                let now = Utc::now();
                self.failures.push_back(now);
                self.prune(now);
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.trip();
                }
            }
            // A stale outcome arriving while open changes nothing
            CircuitState::Open => {}
        }
    }

    /// Time until the next trial is allowed; zero unless open
    pub fn time_until_retry(&self) -> Duration {
        match (self.state, self.open_until) {
            (CircuitState::Open, Some(until)) => {
                let remaining = until - Utc::now();
                remaining.to_std().unwrap_or(Duration::ZERO)
            }
            _ => Duration::ZERO,
        }
    }

    /// Failure count within the current window (for observability)
    pub fn failure_count(&self) -> u32 {
        self.failures.len() as u32
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failures: self.failures.iter().copied().collect(),
            open_until: self.open_until,
            trips: self.trips,
            probe_in_flight: self.probe_in_flight,
        }
    }

    pub fn restore(config: CircuitConfig, snapshot: CircuitSnapshot) -> Self {
        Self {
            config,
            state: snapshot.state,
            failures: snapshot.failures.into(),
            open_until: snapshot.open_until,
            trips: snapshot.trips,
            probe_in_flight: snapshot.probe_in_flight,
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.open_until.map(|t| Utc::now() >= t).unwrap_or(true)
    }

    fn refresh(&mut self) {
        if self.state == CircuitState::Open && self.cooldown_elapsed() {
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = ChronoDuration::milliseconds(self.config.window_ms as i64);
        while let Some(front) = self.failures.front() {
            if now - *front > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn trip(&mut self) {
        self.trips += 1;
        let shift = (self.trips - 1).min(16);
        let raw = self
            .config
            .cooldown_ms
            .saturating_mul(1u64 << shift)
            .min(self.config.max_cooldown_ms);
        let cooldown = jittered_ms(raw, self.config.jitter);

        debug!(
            "Circuit tripped (trip #{}) - cooling down for {}ms",
            self.trips, cooldown
        );

        self.state = CircuitState::Open;
        self.open_until = Some(Utc::now() + ChronoDuration::milliseconds(cooldown as i64));
        self.probe_in_flight = false;
        self.failures.clear();
    }
}
