use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DistributedLock, LockGuard, RETRY_INTERVAL};
use crate::error::LockError;

#[derive(Debug)]
struct Held {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    held: HashMap<String, Held>,
    last_token: u64,
}

/// Single-process lock. Good enough when all workers share one runtime.
#[derive(Debug, Default)]
pub struct LocalLock {
    inner: Mutex<Inner>,
}

impl LocalLock {
    fn try_acquire(&self, name: &str, ttl: Duration, now: Instant) -> Option<LockGuard> {
        let mut inner = self.inner.lock();
        if let Some(held) = inner.held.get(name) {
            if held.expires_at > now {
                return None;
            }
        }
        inner.held.retain(|_, held| held.expires_at > now);
        inner.last_token += 1;
        let token = inner.last_token;
        inner.held.insert(
            name.to_string(),
            Held {
                token,
                expires_at: now + ttl,
            },
        );
        Some(LockGuard {
            name: name.to_string(),
            token,
        })
    }

    /// Largest token issued so far, across all names.
    pub fn highest_token(&self) -> u64 {
        self.inner.lock().last_token
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if let Some(guard) = self.try_acquire(name, ttl, now) {
                return Ok(Some(guard));
            }
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn renew(&self, guard: &LockGuard, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.held.get_mut(&guard.name) {
            Some(held) if held.token == guard.token && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, guard: LockGuard) -> Result<bool, LockError> {
        let mut inner = self.inner.lock();
        match inner.held.get(&guard.name) {
            Some(held) if held.token == guard.token => {
                inner.held.remove(&guard.name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
