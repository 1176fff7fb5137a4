//! Per-classification circuit breaker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation: recovery is attempted.
    #[default]
    Closed,
    /// Tripped: recovery fails fast until the cool-down elapses.
    Open,
    /// Cool-down elapsed: one trial attempt may run.
    HalfOpen,
}

/// Point-in-time view of one breaker, for statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub trips: u64,
    pub trial_in_flight: bool,
}

/// A breaker that opens when tripped and lets a single trial through once
/// the cool-down has passed. While that trial runs every other caller is
/// refused.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    failure_count: u32,
    trips: u64,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether recovery may be attempted at `now`. An open breaker whose
    /// cool-down has elapsed moves to half-open and permits the call. A
    /// half-open breaker refuses calls while its trial is in flight.
    pub fn is_call_permitted(&mut self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|at| now - at).unwrap_or(Duration::MAX);
                if elapsed >= cooldown {
                    debug!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Claim the half-open trial slot. False unless the breaker is
    /// half-open with no trial running.
    pub fn begin_trial(&mut self) -> bool {
        if self.state != CircuitState::HalfOpen || self.trial_in_flight {
            return false;
        }
        self.trial_in_flight = true;
        true
    }

    /// Release the trial slot without a verdict. The breaker stays half-open.
    pub fn abandon_trial(&mut self) {
        self.trial_in_flight = false;
    }

    /// Close after a successful trial.
    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            debug!("Circuit breaker closing after successful trial");
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.failure_count = 0;
        self.trial_in_flight = false;
    }

    pub fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.failure_count += 1;
        self.trips += 1;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_trial_in_flight(&self) -> bool {
        self.trial_in_flight
    }

    pub fn trips(&self) -> u64 {
        self.trips
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            opened_at: self.opened_at,
            trips: self.trips,
            trial_in_flight: self.trial_in_flight,
        }
    }
}
