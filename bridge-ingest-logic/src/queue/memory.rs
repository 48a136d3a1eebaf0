use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use super::QueueBackend;
use crate::{
    error::QueueError,
    types::{DeadLetter, JobEnvelope},
};

#[derive(Default)]
struct Inner {
    pending: HashMap<String, JobEnvelope>,
    due: BTreeSet<(DateTime<Utc>, String)>,
    acked: HashMap<String, DateTime<Utc>>,
    acked_order: VecDeque<(DateTime<Utc>, String)>,
    dead: Vec<DeadLetter>,
}

impl Inner {
    fn remove_pending(&mut self, job_id: &str) -> Option<JobEnvelope> {
        let envelope = self.pending.remove(job_id)?;
        self.due.remove(&(envelope.next_run_at, envelope.job_id.clone()));
        Some(envelope)
    }

    fn forget_acked(&mut self, now: DateTime<Utc>, retention: TimeDelta) {
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return;
        };
        while let Some((acked_at, _)) = self.acked_order.front() {
            if *acked_at > cutoff {
                break;
            }
            if let Some((acked_at, job_id)) = self.acked_order.pop_front() {
                if self.acked.get(&job_id) == Some(&acked_at) {
                    self.acked.remove(&job_id);
                }
            }
        }
    }
}

/// In-process backend. Nothing survives a restart.
///
/// Acked job ids are remembered for `acked_retention` so that a late
/// duplicate is still rejected.
pub struct MemoryQueueBackend {
    inner: Mutex<Inner>,
    acked_retention: TimeDelta,
}

impl Default for MemoryQueueBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 60 * 60))
    }
}

impl MemoryQueueBackend {
    pub fn new(acked_retention: Duration) -> Self {
        Self {
            inner: Mutex::default(),
            acked_retention: TimeDelta::from_std(acked_retention).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Snapshot of pending jobs, earliest first.
    pub fn pending_jobs(&self) -> Vec<JobEnvelope> {
        let inner = self.inner.lock();
        inner
            .due
            .iter()
            .filter_map(|(_, id)| inner.pending.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn enqueue(&self, envelope: &JobEnvelope) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        inner.forget_acked(Utc::now(), self.acked_retention);
        if inner.pending.contains_key(&envelope.job_id) || inner.acked.contains_key(&envelope.job_id) {
            return Ok(false);
        }
        inner
            .due
            .insert((envelope.next_run_at, envelope.job_id.clone()));
        inner
            .pending
            .insert(envelope.job_id.clone(), envelope.clone());
        Ok(true)
    }

    async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobEnvelope>, QueueError> {
        let inner = self.inner.lock();
        Ok(inner
            .due
            .iter()
            .take_while(|(next_run_at, _)| *next_run_at <= now)
            .filter_map(|(_, id)| inner.pending.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn requeue(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.remove_pending(&envelope.job_id).is_some() {
            inner
                .due
                .insert((envelope.next_run_at, envelope.job_id.clone()));
            inner
                .pending
                .insert(envelope.job_id.clone(), envelope.clone());
        }
        Ok(())
    }

    async fn ack(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.remove_pending(&envelope.job_id);
        inner.acked.insert(envelope.job_id.clone(), now);
        inner.acked_order.push_back((now, envelope.job_id.clone()));
        inner.forget_acked(now, self.acked_retention);
        Ok(())
    }

    async fn dead_letter(&self, envelope: &JobEnvelope, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        inner.remove_pending(&envelope.job_id);
        inner.dead.push(DeadLetter {
            envelope: envelope.clone(),
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.inner.lock().dead.iter().take(limit).cloned().collect())
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        Ok(self.inner.lock().pending.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::bridge_message, types::Chain};
    use chrono::TimeDelta;

    #[tokio::test]
    async fn pop_due_orders_by_next_run_at() {
        let backend = MemoryQueueBackend::default();
        let now = Utc::now();
        let late = JobEnvelope::new(bridge_message(Chain::Base, 1, "0x01"), 5, now + TimeDelta::seconds(5));
        let early = JobEnvelope::new(bridge_message(Chain::Base, 2, "0x02"), 5, now - TimeDelta::seconds(5));
        let current = JobEnvelope::new(bridge_message(Chain::Base, 3, "0x03"), 5, now);
        for envelope in [&late, &early, &current] {
            assert!(backend.enqueue(envelope).await.unwrap());
        }

        let due = backend.pop_due(now, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.job_id.as_str()).collect();
        assert_eq!(ids, vec![early.job_id.as_str(), current.job_id.as_str()]);

        assert_eq!(backend.pop_due(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_leaves_pending_set() {
        let backend = MemoryQueueBackend::default();
        let envelope = JobEnvelope::new(bridge_message(Chain::Solana, 9, "sig"), 1, Utc::now());
        backend.enqueue(&envelope).await.unwrap();
        backend.dead_letter(&envelope, "bad payload").await.unwrap();

        assert_eq!(backend.pending_count().await.unwrap(), 0);
        assert!(backend.pop_due(Utc::now(), 10).await.unwrap().is_empty());
        let dead = backend.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "bad payload");
    }

    #[tokio::test]
    async fn acked_ids_are_forgotten_after_retention() {
        let now = Utc::now();
        let remembering = MemoryQueueBackend::default();
        let forgetting = MemoryQueueBackend::new(Duration::ZERO);
        for backend in [&remembering, &forgetting] {
            for position in 0..100 {
                let envelope = JobEnvelope::new(bridge_message(Chain::Base, position, "0x01"), 5, now);
                backend.enqueue(&envelope).await.unwrap();
                backend.ack(&envelope).await.unwrap();
            }
        }

        assert_eq!(remembering.inner.lock().acked.len(), 100);
        let forgotten = forgetting.inner.lock();
        assert!(forgotten.acked.is_empty());
        assert!(forgotten.acked_order.is_empty());
        drop(forgotten);

        let late = JobEnvelope::new(bridge_message(Chain::Base, 0, "0x01"), 5, now);
        assert!(!remembering.enqueue(&late).await.unwrap());
        assert!(forgetting.enqueue(&late).await.unwrap());
    }
}
