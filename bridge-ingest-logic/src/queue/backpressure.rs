use parking_lot::Mutex;

use crate::settings::BackpressureSettings;

#[derive(Debug, Default)]
struct State {
    inflight: usize,
    paused: bool,
}

/// Inflight limiter with hysteresis: dispatch stops once `high` jobs are in
/// flight and resumes only after inflight drains to `resume`.
#[derive(Debug)]
pub struct Backpressure {
    high: usize,
    resume: usize,
    state: Mutex<State>,
}

impl Backpressure {
    pub fn new(settings: &BackpressureSettings) -> Self {
        Self {
            high: settings.high_watermark_inflight,
            resume: settings.resume_threshold,
            state: Mutex::new(State::default()),
        }
    }

    /// Returns `false` when dispatch must pause. A `true` return reserves an
    /// inflight slot that must be released with [`Self::on_finish`].
    pub fn on_dispatch(&self) -> bool {
        let mut state = self.state.lock();
        if state.paused {
            return false;
        }
        if state.inflight >= self.high {
            state.paused = true;
            tracing::warn!(inflight = state.inflight, "backpressure engaged");
            return false;
        }
        state.inflight += 1;
        true
    }

    pub fn on_finish(&self) {
        let mut state = self.state.lock();
        state.inflight = state.inflight.saturating_sub(1);
        if state.paused && state.inflight <= self.resume {
            state.paused = false;
            tracing::info!(inflight = state.inflight, "backpressure released");
        }
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }
}
