use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, Statement, TransactionTrait,
};

use super::QueueBackend;
use crate::{
    database::{connect_sqlite, ensure_schema},
    error::QueueError,
    types::{DeadLetter, JobEnvelope},
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        job_id TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        next_run_at INTEGER NOT NULL,
        acked INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dlq (
        job_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        reason TEXT NOT NULL,
        dead_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_next_run_at ON jobs (next_run_at)",
];

/// Durable single-node backend. Timestamps are unix milliseconds; the
/// `payload` column always holds the latest serialized envelope. Acked rows
/// are kept so that re-enqueueing a delivered event stays a no-op.
pub struct SqliteQueueBackend {
    db: DatabaseConnection,
}

impl SqliteQueueBackend {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let db = connect_sqlite(url).await?;
        Self::new(db).await
    }

    pub async fn new(db: DatabaseConnection) -> Result<Self, QueueError> {
        ensure_schema(&db, SCHEMA).await?;
        Ok(Self { db })
    }
}

fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<bool, QueueError> {
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT OR IGNORE INTO jobs
                    (job_id, payload, attempts, max_attempts, next_run_at, acked, error, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                [
                    envelope.job_id.clone().into(),
                    serde_json::to_string(envelope)?.into(),
                    i64::from(envelope.attempts).into(),
                    i64::from(envelope.max_attempts).into(),
                    envelope.next_run_at.timestamp_millis().into(),
                    i64::from(envelope.acked).into(),
                    envelope.error.clone().into(),
                    Utc::now().timestamp_millis().into(),
                ],
            ))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobEnvelope>, QueueError> {
        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT payload FROM jobs
                 WHERE acked = 0 AND next_run_at <= ?
                 ORDER BY next_run_at ASC
                 LIMIT ?",
                [now.timestamp_millis().into(), to_i64(limit).into()],
            ))
            .await?;

        rows.into_iter()
            .map(|row| -> Result<JobEnvelope, QueueError> {
                let payload: String = row.try_get("", "payload")?;
                Ok(serde_json::from_str(&payload)?)
            })
            .collect()
    }

    async fn requeue(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE jobs SET payload = ?, attempts = ?, next_run_at = ?, error = ?
                 WHERE job_id = ? AND acked = 0",
                [
                    serde_json::to_string(envelope)?.into(),
                    i64::from(envelope.attempts).into(),
                    envelope.next_run_at.timestamp_millis().into(),
                    envelope.error.clone().into(),
                    envelope.job_id.clone().into(),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn ack(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE jobs SET acked = 1, payload = ?, error = NULL WHERE job_id = ?",
                [
                    serde_json::to_string(envelope)?.into(),
                    envelope.job_id.clone().into(),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, envelope: &JobEnvelope, reason: &str) -> Result<(), QueueError> {
        let txn = self.db.begin().await?;
        txn.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO dlq (job_id, payload, attempts, reason, dead_at) VALUES (?, ?, ?, ?, ?)",
            [
                envelope.job_id.clone().into(),
                serde_json::to_string(envelope)?.into(),
                i64::from(envelope.attempts).into(),
                reason.into(),
                Utc::now().timestamp_millis().into(),
            ],
        ))
        .await?;
        txn.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM jobs WHERE job_id = ?",
            [envelope.job_id.clone().into()],
        ))
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT payload, reason, dead_at FROM dlq ORDER BY rowid ASC LIMIT ?",
                [to_i64(limit).into()],
            ))
            .await?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetter, QueueError> {
                let payload: String = row.try_get("", "payload")?;
                let reason: String = row.try_get("", "reason")?;
                let dead_at: i64 = row.try_get("", "dead_at")?;
                Ok(DeadLetter {
                    envelope: serde_json::from_str(&payload)?,
                    reason,
                    dead_at: DateTime::from_timestamp_millis(dead_at).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        let row = self
            .db
            .query_one(Statement::from_string(
                DbBackend::Sqlite,
                "SELECT COUNT(*) AS n FROM jobs WHERE acked = 0",
            ))
            .await?;
        let count: i64 = match row {
            Some(row) => row.try_get("", "n")?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }
}
