//! Mutual exclusion with a TTL.
//!
//! Every acquisition is issued a fencing token from a counter shared by all
//! lock names, so tokens also grow monotonically per name. Renew and release
//! only succeed while the stored token still matches the caller's, so a
//! holder whose lease expired cannot disturb the next owner.

mod local;
mod redis;

pub use self::redis::RedisFencingLock;
pub use local::LocalLock;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{error::LockError, settings::LockBackendSettings};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub name: String,
    pub token: u64,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take `name` for `ttl`, retrying until `timeout` elapses.
    /// Returns `None` if the lock is still held by someone else.
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError>;

    /// Extend the lease. `false` means ownership was lost.
    async fn renew(&self, guard: &LockGuard, ttl: Duration) -> Result<bool, LockError>;

    /// `false` means the lock was already taken over or expired.
    async fn release(&self, guard: LockGuard) -> Result<bool, LockError>;
}

pub async fn lock_from_settings(
    settings: &LockBackendSettings,
) -> Result<Arc<dyn DistributedLock>, LockError> {
    let lock: Arc<dyn DistributedLock> = match settings {
        LockBackendSettings::Local => Arc::new(LocalLock::default()),
        LockBackendSettings::Redis { url, namespace } => {
            Arc::new(RedisFencingLock::connect(url, namespace).await?)
        }
    };
    Ok(lock)
}
