use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strum_macros::{AsRefStr, Display};

use crate::settings::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Value exported through the circuit breaker gauge.
    pub fn gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    errors: u32,
    opened_at: Option<Instant>,
    trial_granted: bool,
}

/// Three-state breaker guarding an upstream.
///
/// `window_errors` consecutive errors open the circuit. After `reset_after`
/// a single trial call is let through; its success closes the circuit, its
/// failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    window_errors: u32,
    reset_after: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: &CircuitBreakerSettings) -> Self {
        Self {
            window_errors: settings.window_errors.max(1),
            reset_after: settings.reset_after,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                errors: 0,
                opened_at: None,
                trial_granted: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened_at| now.saturating_duration_since(opened_at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_after {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_granted = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_granted {
                    false
                } else {
                    inner.trial_granted = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(from = %inner.state, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.errors = 0;
        inner.opened_at = None;
        inner.trial_granted = false;
    }

    pub fn on_error(&self) {
        self.on_error_at(Instant::now())
    }

    pub fn on_error_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => {}
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.trial_granted = false;
                tracing::warn!("trial call failed, circuit reopened");
            }
            BreakerState::Closed => {
                inner.errors += 1;
                if inner.errors >= self.window_errors {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(errors = inner.errors, "circuit opened");
                }
            }
        }
    }
}
