use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use super::{DistributedLock, LockGuard, RETRY_INTERVAL};
use crate::error::LockError;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Fencing lock shared between processes.
///
/// `{ns}:ctr` is a single `INCR` counter issuing tokens for every name.
/// `{ns}:lock:{name}` holds the current owner's token with a `PX` expiry.
pub struct RedisFencingLock {
    conn: ConnectionManager,
    namespace: String,
    renew: Script,
    release: Script,
}

impl RedisFencingLock {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, namespace))
    }

    pub fn new(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            namespace: namespace.to_string(),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn counter_key(&self) -> String {
        format!("{}:ctr", self.namespace)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.namespace)
    }

    /// Largest token issued in the namespace. When two holders briefly both
    /// believe they own a lock, the one with the larger token wins.
    pub async fn highest_token(&self) -> Result<u64, LockError> {
        let mut conn = self.conn.clone();
        let token: Option<u64> = conn.get(self.counter_key()).await?;
        Ok(token.unwrap_or(0))
    }

    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let mut conn = self.conn.clone();
        let token: u64 = conn.incr(self.counter_key(), 1).await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set.map(|_| LockGuard {
            name: name.to_string(),
            token,
        }))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl DistributedLock for RedisFencingLock {
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_acquire(name, ttl).await? {
                return Ok(Some(guard));
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(name, "lock acquisition timed out");
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn renew(&self, guard: &LockGuard, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew
            .key(self.lock_key(&guard.name))
            .arg(guard.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, guard: LockGuard) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.lock_key(&guard.name))
            .arg(guard.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lock(namespace: &str) -> RedisFencingLock {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let lock = RedisFencingLock::connect(&url, namespace).await.unwrap();
        let mut conn = lock.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{namespace}:*")).await.unwrap();
        if !keys.is_empty() {
            let _: () = conn.del(keys).await.unwrap();
        }
        lock
    }

    #[tokio::test]
    #[ignore = "needs redis to run"]
    async fn tokens_increase_and_stale_holder_is_fenced() {
        let lock = lock("test_fencing").await;
        let stale = lock
            .acquire("evt", Duration::from_millis(50), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(
            lock.acquire("evt", Duration::from_secs(10), Duration::from_millis(10))
                .await
                .unwrap()
                .is_none()
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let fresh = lock
            .acquire("evt", Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(fresh.token > stale.token);
        assert!(!lock.renew(&stale, Duration::from_secs(10)).await.unwrap());
        assert!(!lock.release(stale).await.unwrap());

        assert!(lock.highest_token().await.unwrap() >= fresh.token);
        assert!(lock.release(fresh).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs redis to run"]
    async fn released_names_leave_only_the_counter() {
        let lock = lock("test_fencing_keys").await;
        for i in 0..50 {
            let guard = lock
                .acquire(&format!("apply_event:{i}"), Duration::from_secs(10), Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            assert!(lock.release(guard).await.unwrap());
        }

        let mut conn = lock.conn.clone();
        let keys: Vec<String> = conn.keys("test_fencing_keys:*").await.unwrap();
        assert_eq!(keys, vec!["test_fencing_keys:ctr".to_string()]);
        assert_eq!(lock.highest_token().await.unwrap(), 50);
    }
}
