use std::{collections::HashMap, num::NonZeroU32, time::Duration};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};

use crate::settings::RateLimitSettings;

// Refill period used for buckets whose rate has no representable period.
const NEVER_REFILL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

enum Bucket {
    Limited(DefaultDirectRateLimiter),
    /// `burst = 0`: nothing ever passes.
    Closed,
}

/// Token buckets keyed by `{chain}:{type}`. Keys without a configured bucket
/// are never limited.
pub struct RateLimiter {
    buckets: HashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(limits: &HashMap<String, RateLimitSettings>) -> Self {
        let buckets = limits
            .iter()
            .map(|(key, limit)| (key.clone(), Self::bucket(limit)))
            .collect();
        Self { buckets }
    }

    pub fn unlimited() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    fn bucket(limit: &RateLimitSettings) -> Bucket {
        let Some(burst) = NonZeroU32::new(limit.burst) else {
            return Bucket::Closed;
        };
        let period = limit.refill_period().unwrap_or(NEVER_REFILL);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Bucket::Limited(GovernorLimiter::direct(quota))
    }

    pub fn allow(&self, key: &str) -> bool {
        match self.buckets.get(key) {
            None => true,
            Some(Bucket::Closed) => false,
            Some(Bucket::Limited(limiter)) => limiter.check().is_ok(),
        }
    }
}
