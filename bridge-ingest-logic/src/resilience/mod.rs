mod adaptive_poll;
mod circuit_breaker;

pub use adaptive_poll::AdaptivePoll;
pub use circuit_breaker::{BreakerState, CircuitBreaker};
