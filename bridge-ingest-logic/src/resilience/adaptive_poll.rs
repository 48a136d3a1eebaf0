use std::time::Duration;

use crate::settings::PollSettings;

/// Poll interval that speeds up while there is backlog and backs off when
/// idle or failing. Always within `[min_interval, max_interval]`.
#[derive(Debug, Clone)]
pub struct AdaptivePoll {
    base: Duration,
    min: Duration,
    max: Duration,
    current: Duration,
}

impl AdaptivePoll {
    pub fn new(settings: &PollSettings) -> Self {
        let min = settings.min_interval.min(settings.max_interval);
        let max = settings.max_interval.max(min);
        let base = settings.interval.clamp(min, max);
        Self {
            base,
            min,
            max,
            current: base,
        }
    }

    pub fn interval(&self) -> Duration {
        self.current
    }

    pub fn faster(&mut self) {
        self.current = (self.current / 2).max(self.min);
    }

    pub fn slower(&mut self) {
        self.current = self.current.mul_f64(1.5).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
