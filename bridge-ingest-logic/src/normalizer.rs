//! Raw event to canonical event conversion and the sink that feeds the job
//! queue.
//!
//! The event id is the idempotency key of the whole pipeline:
//! `sha256("{chain}|{tx_hash}|{log_index}|{slot}|{payload}")` where absent
//! pointer fields render as the empty string and the payload is serialized
//! with object keys sorted at every depth. Identical origin and payload
//! always give the same id, no matter when or how often they are observed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    error::{NormalizeError, SinkError},
    metrics::Metrics,
    queue::JobQueue,
    types::{CanonicalEvent, Chain, ChainPointer, EventBody, Payload, RawEvent},
};

/// Downstream of the watchers and of the replay path.
///
/// An `Ok` return means the event is durably accepted; on error the caller
/// must not advance any checkpoint past it.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, raw: RawEvent) -> Result<(), SinkError>;
}

pub fn event_id(
    chain: Chain,
    tx_hash: Option<&str>,
    log_index: Option<u64>,
    slot: Option<u64>,
    payload: &Payload,
) -> String {
    let mut canonical = String::new();
    write_canonical_object(payload, &mut canonical);

    let preimage = format!(
        "{chain}|{}|{}|{}|{canonical}",
        tx_hash.unwrap_or_default(),
        log_index.map(|i| i.to_string()).unwrap_or_default(),
        slot.map(|s| s.to_string()).unwrap_or_default(),
    );
    hex::encode(Sha256::digest(preimage.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_canonical_object(map: &Payload, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}

/// Converts a raw event into its canonical form. Pure apart from
/// `observed_at`, which the caller supplies.
pub fn normalize(raw: RawEvent, observed_at: DateTime<Utc>) -> Result<CanonicalEvent, NormalizeError> {
    let id = event_id(
        raw.chain,
        raw.tx_hash.as_deref(),
        raw.log_index,
        raw.slot,
        &raw.payload,
    );
    let kind = raw.kind;
    let body = EventBody::decode(kind, raw.payload)
        .map_err(|source| NormalizeError::Payload { kind, source })?;

    Ok(CanonicalEvent {
        id,
        source: ChainPointer {
            chain: raw.chain,
            block_number: raw.block_number,
            slot: raw.slot,
            tx_hash: raw.tx_hash,
            log_index: raw.log_index,
        },
        observed_at,
        body,
    })
}

/// Normalizes raw events and enqueues them as jobs.
pub struct EventRouter {
    queue: Arc<JobQueue>,
    metrics: Arc<Metrics>,
}

impl EventRouter {
    pub fn new(queue: Arc<JobQueue>, metrics: Arc<Metrics>) -> Self {
        Self { queue, metrics }
    }

    /// Entry point for untyped events, e.g. submitted by an operator.
    pub async fn emit_json(&self, value: Value) -> Result<(), SinkError> {
        let raw = RawEvent::from_json(value)?;
        self.emit(raw).await
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn emit(&self, raw: RawEvent) -> Result<(), SinkError> {
        let chain = raw.chain;
        let kind = raw.kind;
        let event = normalize(raw, Utc::now())
            .inspect_err(|err| tracing::error!(%chain, %kind, err = %err, "rejected raw event"))?;

        self.metrics
            .events_received
            .with_label_values(&[chain.as_ref(), kind.as_ref()])
            .inc();

        let inserted = self.queue.enqueue(event).await?;
        if !inserted {
            tracing::debug!(%chain, %kind, "event already queued");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{Backpressure, MemoryQueueBackend, RateLimiter},
        settings::{BackpressureSettings, QueueSettings},
        test_utils::RecordingHandler,
        types::EventKind,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn id_is_reproducible_and_ignores_key_order() {
        let a = payload(json!({"asset": "USDC", "amount": "1", "meta": {"x": 1, "y": 2}}));
        let b = payload(json!({"meta": {"y": 2, "x": 1}, "amount": "1", "asset": "USDC"}));
        let id_a = event_id(Chain::Base, Some("0xabc"), Some(0), None, &a);
        let id_b = event_id(Chain::Base, Some("0xabc"), Some(0), None, &b);
        assert_eq!(id_a, id_b);
        assert_eq!(id_a.len(), 64);
    }

    #[rstest]
    #[case(Chain::Solana, Some("0xabc"), Some(0), None, json!({"asset": "USDC"}))]
    #[case(Chain::Base, Some("0xabd"), Some(0), None, json!({"asset": "USDC"}))]
    #[case(Chain::Base, Some("0xabc"), Some(1), None, json!({"asset": "USDC"}))]
    #[case(Chain::Base, Some("0xabc"), Some(0), Some(5), json!({"asset": "USDC"}))]
    #[case(Chain::Base, Some("0xabc"), Some(0), None, json!({"asset": "USDT"}))]
    #[case(Chain::Base, None, Some(0), None, json!({"asset": "USDC"}))]
    fn changing_any_field_changes_id(
        #[case] chain: Chain,
        #[case] tx_hash: Option<&str>,
        #[case] log_index: Option<u64>,
        #[case] slot: Option<u64>,
        #[case] changed: Value,
    ) {
        let reference = event_id(
            Chain::Base,
            Some("0xabc"),
            Some(0),
            None,
            &payload(json!({"asset": "USDC"})),
        );
        assert_ne!(
            event_id(chain, tx_hash, log_index, slot, &payload(changed)),
            reference
        );
    }

    #[test]
    fn normalize_builds_typed_body() {
        let raw = RawEvent::new(
            Chain::Base,
            EventKind::BridgeMessage,
            payload(json!({"direction": "base->solana", "asset": "USDC", "amount": "10"})),
        )
        .with_block_number(100)
        .with_tx("0xabc", Some(2));
        let observed_at = Utc::now();

        let event = normalize(raw.clone(), observed_at).unwrap();
        assert_eq!(event.kind(), EventKind::BridgeMessage);
        assert_eq!(event.source.block_number, Some(100));
        assert_eq!(event.observed_at, observed_at);
        assert_eq!(
            event.id,
            event_id(Chain::Base, Some("0xabc"), Some(2), None, &raw.payload)
        );

        let later = normalize(raw, Utc::now()).unwrap();
        assert_eq!(later.id, event.id);
    }

    fn router() -> (Arc<JobQueue>, EventRouter) {
        let metrics = Arc::new(Metrics::unregistered());
        let queue = Arc::new(JobQueue::new(
            Arc::new(MemoryQueueBackend::default()),
            Arc::new(RecordingHandler::default()),
            RateLimiter::unlimited(),
            Arc::new(Backpressure::new(&BackpressureSettings::default())),
            QueueSettings::default(),
            metrics.clone(),
        ));
        (queue.clone(), EventRouter::new(queue, metrics))
    }

    #[tokio::test]
    async fn router_enqueues_each_event_once() {
        let (queue, router) = router();
        let submitted = json!({
            "chain": "base",
            "type": "TRANSFER",
            "tx_hash": "0xabc",
            "log_index": 1,
            "block_number": 10,
            "payload": {"asset": "USDC", "amount": "5"},
        });
        router.emit_json(submitted.clone()).await.unwrap();
        router.emit_json(submitted).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        assert_eq!(
            router
                .metrics
                .events_received
                .with_label_values(&["base", "TRANSFER"])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn router_rejects_untyped_events() {
        let (queue, router) = router();
        let err = router
            .emit_json(json!({"chain": "base", "payload": {}}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::Normalize(NormalizeError::MissingField("type"))
        ));
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}
