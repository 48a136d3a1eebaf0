//! Durable, retryable delivery of canonical events to a handler.
//!
//! Delivery is at-least-once. Deduplication happens twice: at enqueue time
//! (the job id is the event id, so a duplicate insert is a no-op) and in the
//! handler (processed markers), which is what correctness relies on when
//! several workers pop the same due job.

mod backpressure;
mod memory;
mod rate_limiter;
mod redis;
mod sqlite;

pub use backpressure::Backpressure;
pub use memory::MemoryQueueBackend;
pub use rate_limiter::RateLimiter;
pub use self::redis::RedisQueueBackend;
pub use sqlite::SqliteQueueBackend;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::{StreamExt, stream::FuturesUnordered};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    error::QueueError,
    metrics::{Metrics, gauge_value},
    settings::{QueueBackendSettings, QueueSettings},
    types::{CanonicalEvent, DeadLetter, JobEnvelope},
};

/// Storage contract of the job queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Inserts the job unless one with the same `job_id` is known. Returns
    /// whether a new job was stored.
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<bool, QueueError>;

    /// Up to `limit` pending jobs with `next_run_at <= now`, earliest first.
    /// Jobs stay pending until acked, requeued or dead-lettered.
    async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobEnvelope>, QueueError>;

    async fn requeue(&self, envelope: &JobEnvelope) -> Result<(), QueueError>;

    async fn ack(&self, envelope: &JobEnvelope) -> Result<(), QueueError>;

    async fn dead_letter(&self, envelope: &JobEnvelope, reason: &str) -> Result<(), QueueError>;

    /// Oldest dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn pending_count(&self) -> Result<u64, QueueError>;
}

pub async fn backend_from_settings(
    settings: &QueueBackendSettings,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    Ok(match settings {
        QueueBackendSettings::Memory { acked_retention } => {
            Arc::new(MemoryQueueBackend::new(*acked_retention))
        }
        QueueBackendSettings::Sqlite { url } => Arc::new(SqliteQueueBackend::connect(url).await?),
        QueueBackendSettings::Redis {
            url,
            namespace,
            acked_retention,
        } => Arc::new(RedisQueueBackend::connect(url, namespace, *acked_retention).await?),
    })
}

/// Consumer of dequeued events.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, event: &CanonicalEvent) -> anyhow::Result<()>;
}

/// Exponential retry delay: `min(cap, 2^attempts)` seconds.
pub fn backoff(attempts: u32, cap: Duration) -> Duration {
    let secs = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    Retried,
    DeadLettered,
    RateLimited,
}

/// What a single [`JobQueue::tick`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub rate_limited: usize,
    /// Settlement writes that failed; those jobs stay due and are retried.
    pub backend_errors: usize,
}

pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    limiter: RateLimiter,
    backpressure: Arc<Backpressure>,
    settings: QueueSettings,
    metrics: Arc<Metrics>,
}

impl JobQueue {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
        limiter: RateLimiter,
        backpressure: Arc<Backpressure>,
        settings: QueueSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            handler,
            limiter,
            backpressure,
            settings,
            metrics,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub async fn enqueue(&self, event: CanonicalEvent) -> Result<bool, QueueError> {
        self.enqueue_at(event, Utc::now()).await
    }

    pub async fn enqueue_at(&self, event: CanonicalEvent, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let envelope = JobEnvelope::new(event, self.settings.max_attempts, now);
        self.backend.enqueue(&envelope).await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.backend.dead_letters(limit).await
    }

    pub async fn pending_count(&self) -> Result<u64, QueueError> {
        self.backend.pending_count().await
    }

    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        self.tick_at(Utc::now()).await
    }

    /// Pops up to `batch` due jobs and delivers them concurrently. Stops
    /// dispatching as soon as backpressure reports a pause.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, QueueError> {
        let due = self.backend.pop_due(now, self.settings.batch).await?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        let mut running = FuturesUnordered::new();
        for envelope in due {
            if !self.backpressure.on_dispatch() {
                tracing::debug!(
                    inflight = self.backpressure.inflight(),
                    "dispatch paused by backpressure"
                );
                break;
            }
            self.update_inflight();
            report.dispatched += 1;
            running.push(self.deliver(envelope, now));
        }

        while let Some(outcome) = running.next().await {
            match outcome {
                Some(Outcome::Acked) => report.acked += 1,
                Some(Outcome::Retried) => report.retried += 1,
                Some(Outcome::DeadLettered) => report.dead_lettered += 1,
                Some(Outcome::RateLimited) => report.rate_limited += 1,
                None => report.backend_errors += 1,
            }
        }
        Ok(report)
    }

    async fn deliver(&self, envelope: JobEnvelope, now: DateTime<Utc>) -> Option<Outcome> {
        let job_id = envelope.job_id.clone();
        let outcome = self
            .settle(envelope, now)
            .await
            .inspect_err(|err| tracing::error!(job_id, err = ?err, "failed to settle job"))
            .ok();
        self.backpressure.on_finish();
        self.update_inflight();
        outcome
    }

    async fn settle(&self, mut envelope: JobEnvelope, now: DateTime<Utc>) -> Result<Outcome, QueueError> {
        let key = envelope.event.rate_limit_key();
        if !self.limiter.allow(&key) {
            envelope.next_run_at = after(now, self.settings.rate_limit_delay);
            self.backend.requeue(&envelope).await?;
            self.metrics
                .jobs_rate_limited
                .with_label_values(&[key.as_str()])
                .inc();
            return Ok(Outcome::RateLimited);
        }

        let kind = envelope.event.kind();
        let timer = self
            .metrics
            .apply_latency
            .with_label_values(&[kind.as_ref()])
            .start_timer();
        let result = self.handler.handle(&envelope.event).await;
        timer.observe_duration();

        match result {
            Ok(()) => {
                envelope.acked = true;
                envelope.error = None;
                self.backend.ack(&envelope).await?;
                self.metrics
                    .jobs_processed
                    .with_label_values(&[kind.as_ref()])
                    .inc();
                Ok(Outcome::Acked)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                envelope.attempts += 1;
                envelope.error = Some(reason.clone());
                self.metrics
                    .jobs_failed
                    .with_label_values(&[kind.as_ref()])
                    .inc();

                if envelope.is_exhausted() {
                    self.backend.dead_letter(&envelope, &reason).await?;
                    self.metrics
                        .jobs_dead_lettered
                        .with_label_values(&[kind.as_ref()])
                        .inc();
                    tracing::error!(
                        job_id = envelope.job_id,
                        %kind,
                        attempts = envelope.attempts,
                        reason,
                        "job dead-lettered"
                    );
                    Ok(Outcome::DeadLettered)
                } else {
                    let delay = backoff(envelope.attempts, self.settings.backoff_cap);
                    envelope.next_run_at = after(now, delay);
                    self.backend.requeue(&envelope).await?;
                    tracing::warn!(
                        job_id = envelope.job_id,
                        %kind,
                        attempts = envelope.attempts,
                        retry_in = ?delay,
                        reason,
                        "job failed, scheduled retry"
                    );
                    Ok(Outcome::Retried)
                }
            }
        }
    }

    fn update_inflight(&self) {
        self.metrics
            .queue_inflight
            .set(gauge_value(self.backpressure.inflight() as u64));
    }

    /// Ticks every `tick_interval` until `cancel` fires. A tick in progress
    /// is always completed.
    #[instrument(name = "queue_worker", skip(self, cancel), level = "info")]
    pub async fn run(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("queue worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick().await {
                Ok(report) if report.dispatched > 0 => {
                    tracing::debug!(?report, "queue tick finished");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(err = ?err, "queue tick failed"),
            }
        }

        tracing::info!("queue worker stopped");
    }
}
