use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};

use super::QueueBackend;
use crate::{
    error::QueueError,
    types::{DeadLetter, JobEnvelope},
};

/// Shared backend for multi-process deployments.
///
/// Layout under `{ns}`:
/// - `{ns}:due` sorted set of pending job ids scored by `next_run_at` (ms)
/// - `{ns}:job:{id}` hash with the serialized envelope in `payload`
/// - `{ns}:dlq` list of serialized dead letters
///
/// Acked jobs keep their hash for `acked_retention` so that a late
/// duplicate enqueue is still ignored.
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    namespace: String,
    acked_retention: Duration,
}

impl RedisQueueBackend {
    pub async fn connect(url: &str, namespace: &str, acked_retention: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, namespace, acked_retention))
    }

    pub fn new(conn: ConnectionManager, namespace: &str, acked_retention: Duration) -> Self {
        Self {
            conn,
            namespace: namespace.to_string(),
            acked_retention,
        }
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.namespace)
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{job_id}", self.namespace)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.namespace)
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(envelope)?;
        let inserted: bool = conn
            .hset_nx(self.job_key(&envelope.job_id), "payload", payload)
            .await?;
        if inserted {
            let _: () = conn
                .zadd(
                    self.due_key(),
                    &envelope.job_id,
                    envelope.next_run_at.timestamp_millis(),
                )
                .await?;
        }
        Ok(inserted)
    }

    async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobEnvelope>, QueueError> {
        let mut conn = self.conn.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.due_key(), "-inf", now.timestamp_millis(), 0, count)
            .await?;
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(self.job_key(id), "payload");
        }
        let payloads: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        payloads
            .into_iter()
            .zip(ids)
            .filter_map(|(payload, id)| match payload {
                Some(payload) => Some(payload),
                None => {
                    tracing::warn!(job_id = id, "due job has no payload, skipping");
                    None
                }
            })
            .map(|payload| serde_json::from_str(&payload).map_err(QueueError::from))
            .collect()
    }

    async fn requeue(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(envelope)?;
        let _: () = redis::pipe()
            .atomic()
            .hset(self.job_key(&envelope.job_id), "payload", payload)
            .ignore()
            .zadd(
                self.due_key(),
                &envelope.job_id,
                envelope.next_run_at.timestamp_millis(),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ack(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(envelope)?;
        let retention_ms = i64::try_from(self.acked_retention.as_millis()).unwrap_or(i64::MAX);
        let _: () = redis::pipe()
            .atomic()
            .hset(self.job_key(&envelope.job_id), "payload", payload)
            .ignore()
            .zrem(self.due_key(), &envelope.job_id)
            .ignore()
            .pexpire(self.job_key(&envelope.job_id), retention_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, envelope: &JobEnvelope, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let letter = DeadLetter {
            envelope: envelope.clone(),
            reason: reason.to_string(),
            dead_at: Utc::now(),
        };
        let _: () = redis::pipe()
            .atomic()
            .rpush(self.dlq_key(), serde_json::to_string(&letter)?)
            .ignore()
            .zrem(self.due_key(), &envelope.job_id)
            .ignore()
            .del(self.job_key(&envelope.job_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let letters: Vec<String> = conn.lrange(self.dlq_key(), 0, stop).await?;
        letters
            .iter()
            .map(|letter| serde_json::from_str(letter).map_err(QueueError::from))
            .collect()
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(self.due_key()).await?;
        Ok(count)
    }
}
