//! Applies canonical events to durable domain state exactly once and
//! confirms pending bridge messages as chain heads advance.

mod confirmation;
mod signature;
mod snapshot;

pub use confirmation::ChainHeadRecord;
pub use snapshot::{AgentStatus, DomainSnapshot, PendingMessage, TransferRecord};

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::instrument;

use crate::{
    error::{ApplyError, StoreError},
    lock::{DistributedLock, LockGuard},
    metrics::{Metrics, gauge_value},
    queue::JobHandler,
    settings::{ConfirmationSettings, EngineSettings, LockSettings},
    store::{self, StateStore},
    types::{CanonicalEvent, Chain, ChainHeadPayload, ChainPointer, EventBody, EventKind},
};
use snapshot::SNAPSHOT_KEY;

#[derive(Debug, Serialize)]
struct ProcessedMarker<'a> {
    at: DateTime<Utc>,
    source: &'a ChainPointer,
}

fn processed_key(event_id: &str) -> String {
    format!("processed:{event_id}")
}

pub struct StateEngine {
    store: Arc<dyn StateStore>,
    lock: Arc<dyn DistributedLock>,
    settings: EngineSettings,
    confirmations: ConfirmationSettings,
    locks: LockSettings,
    metrics: Arc<Metrics>,
}

impl StateEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        lock: Arc<dyn DistributedLock>,
        settings: EngineSettings,
        confirmations: ConfirmationSettings,
        locks: LockSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            lock,
            settings,
            confirmations,
            locks,
            metrics,
        }
    }

    pub async fn snapshot(&self) -> Result<DomainSnapshot, ApplyError> {
        Ok(match self.store.get(SNAPSHOT_KEY).await? {
            Some(value) => serde_json::from_value(value).map_err(StoreError::from)?,
            None => DomainSnapshot::default(),
        })
    }

    pub async fn head(&self, chain: Chain) -> Result<Option<u64>, ApplyError> {
        Ok(self.head_record(chain).await?.position(chain))
    }

    pub async fn is_processed(&self, event_id: &str) -> Result<bool, ApplyError> {
        Ok(self.store.get(&processed_key(event_id)).await?.is_some())
    }

    /// Head events are merged without locking since the merge is monotonic.
    /// Every other event runs under a per-event lock and is skipped if its
    /// `processed:<id>` marker is already set.
    #[instrument(skip_all, fields(event_id = %event.id, kind = %event.kind()), level = "debug")]
    pub async fn apply_event(&self, event: &CanonicalEvent) -> Result<(), ApplyError> {
        let now = Utc::now();
        if let EventBody::ChainHead(payload) = &event.body {
            return self.apply_chain_head(event, payload, now).await;
        }

        let lock_name = format!("apply_event:{}", event.id);
        let guard = self
            .lock
            .acquire(&lock_name, self.locks.ttl, self.locks.acquire_timeout)
            .await?
            .ok_or_else(|| ApplyError::LockTimeout(lock_name.clone()))?;

        let result = self.apply_locked(event, &guard, now).await;

        match self.lock.release(guard).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(lock = lock_name, "lock expired before release"),
            Err(err) => tracing::warn!(lock = lock_name, err = ?err, "failed to release lock"),
        }
        result
    }

    async fn apply_locked(
        &self,
        event: &CanonicalEvent,
        guard: &LockGuard,
        now: DateTime<Utc>,
    ) -> Result<(), ApplyError> {
        let marker_key = processed_key(&event.id);
        if self.store.get(&marker_key).await?.is_some() {
            tracing::debug!("event already applied");
            return Ok(());
        }
        self.hold(guard).await?;

        match &event.body {
            EventBody::AgentSignal(payload) => {
                if self.settings.verify_signatures && signature::verify_agent_signal(payload)? {
                    tracing::debug!(agent_id = ?payload.agent_id, "agent signature verified");
                }
                self.update_snapshot(|snapshot| snapshot.record_agent_signal(event, payload, now))
                    .await?;
            }
            EventBody::BridgeMessage(payload) => {
                let added = self
                    .update_snapshot(|snapshot| snapshot.add_message(event, payload))
                    .await?;
                if !added {
                    tracing::debug!("bridge message already tracked");
                }
                self.sweep(now).await?;
            }
            EventBody::Transfer(payload) => {
                self.update_snapshot(|snapshot| snapshot.add_transfer(event, payload))
                    .await?;
            }
            EventBody::OracleUpdate(payload) => {
                self.update_snapshot(|snapshot| snapshot.merge_oracle(payload))
                    .await?;
            }
            EventBody::ChainHead(payload) => {
                return self.apply_chain_head(event, payload, now).await;
            }
        }

        let marker = ProcessedMarker {
            at: now,
            source: &event.source,
        };
        let marker = serde_json::to_value(&marker).map_err(StoreError::from)?;
        self.hold(guard).await?;
        self.store.set(&marker_key, marker).await?;
        Ok(())
    }

    /// Extends the lease before a write. A holder whose token was fenced out
    /// must not write.
    async fn hold(&self, guard: &LockGuard) -> Result<(), ApplyError> {
        if self.lock.renew(guard, self.locks.ttl).await? {
            Ok(())
        } else {
            Err(ApplyError::LockLost {
                name: guard.name.clone(),
                token: guard.token,
            })
        }
    }

    async fn apply_chain_head(
        &self,
        event: &CanonicalEvent,
        payload: &ChainHeadPayload,
        now: DateTime<Utc>,
    ) -> Result<(), ApplyError> {
        let chain = event.chain();
        let observed = match chain {
            Chain::Base => payload.block_number,
            Chain::Solana => payload.slot,
        }
        .or(event.source.position())
        .ok_or(ApplyError::MissingField {
            kind: EventKind::ChainHead,
            field: chain.position_field(),
        })?;

        let head = store::update(
            self.store.as_ref(),
            &chain.head_key(),
            |head: &mut ChainHeadRecord| {
                head.merge(chain, observed, now);
                Ok::<_, ApplyError>(head.position(chain).unwrap_or(observed))
            },
        )
        .await?;
        if head > observed {
            tracing::debug!(%chain, head, observed, "stale head ignored");
        }
        self.metrics
            .chain_head
            .with_label_values(&[chain.as_ref()])
            .set(gauge_value(head));

        self.sweep(now).await
    }

    async fn head_record(&self, chain: Chain) -> Result<ChainHeadRecord, ApplyError> {
        Ok(match self.store.get(&chain.head_key()).await? {
            Some(value) => serde_json::from_value(value).map_err(StoreError::from)?,
            None => ChainHeadRecord::default(),
        })
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<(), ApplyError> {
        let mut heads = HashMap::new();
        for chain in Chain::iter() {
            if let Some(position) = self.head(chain).await? {
                heads.insert(chain, position);
            }
        }
        if heads.is_empty() {
            return Ok(());
        }

        let confirmed = self
            .update_snapshot(|snapshot| confirmation::sweep(snapshot, &heads, &self.confirmations, now))
            .await?;
        for chain in confirmed {
            self.metrics
                .messages_confirmed
                .with_label_values(&[chain.as_ref()])
                .inc();
            tracing::info!(%chain, "bridge message confirmed");
        }
        Ok(())
    }

    async fn update_snapshot<R>(
        &self,
        mut f: impl FnMut(&mut DomainSnapshot) -> R,
    ) -> Result<R, ApplyError> {
        store::update(self.store.as_ref(), SNAPSHOT_KEY, |snapshot: &mut DomainSnapshot| {
            Ok::<_, ApplyError>(f(snapshot))
        })
        .await
    }
}

#[async_trait]
impl JobHandler for StateEngine {
    async fn handle(&self, event: &CanonicalEvent) -> anyhow::Result<()> {
        self.apply_event(event).await?;
        Ok(())
    }
}
