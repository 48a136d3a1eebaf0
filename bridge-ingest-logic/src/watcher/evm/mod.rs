//! Watcher of the EVM-style chain.
//!
//! Every poll emits a `CHAIN_HEAD` for the current block and then scans
//! confirmed blocks past the `checkpoint:base` key for logs of the
//! configured contracts. A separate per-contract historical scan covers the
//! configured start point once at startup.

mod client;
mod decoder;
mod historical;

pub use client::{AlloyEvmClient, EvmClient, EvmLog, LogQuery};
pub use decoder::{AbiDecoder, raw_payload};
pub use historical::contract_checkpoint_key;

use std::{ops::RangeInclusive, sync::Arc, time::Duration};

use alloy::primitives::Address;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{ScanReport, advance_checkpoint, batches, catch_up_range, report_breaker};
use crate::{
    error::{DecodeError, WatcherError},
    metrics::Metrics,
    normalizer::EventSink,
    resilience::{AdaptivePoll, BreakerState, CircuitBreaker},
    settings::{EvmContractSettings, EvmSettings},
    store::{self, StateStore},
    types::{Chain, EventKind, RawEvent},
};

const CHAIN: Chain = Chain::Base;

pub struct EvmWatcher {
    client: Arc<dyn EvmClient>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn StateStore>,
    decoder: AbiDecoder,
    settings: EvmSettings,
    confirmations: u64,
    breaker: CircuitBreaker,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl EvmWatcher {
    /// Fails if one of the configured ABI files cannot be loaded.
    pub fn new(
        client: Arc<dyn EvmClient>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn StateStore>,
        settings: EvmSettings,
        confirmations: u64,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Result<Self, DecodeError> {
        let decoder = AbiDecoder::from_files(&settings.abi_files)?;
        let breaker = CircuitBreaker::new(&settings.circuit_breaker);
        Ok(Self {
            client,
            sink,
            store,
            decoder,
            settings,
            confirmations,
            breaker,
            cancel,
            metrics,
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Fetches the head, emits it and runs one catch-up step. Failures are
    /// reported to the circuit breaker; an open breaker short-circuits.
    pub async fn poll_once(&self) -> Result<ScanReport, WatcherError> {
        if !self.breaker.allow() {
            report_breaker(&self.metrics, CHAIN, "poll", &self.breaker);
            return Err(WatcherError::CircuitOpen);
        }
        let result = self.poll_head_and_catch_up().await;
        match &result {
            Ok(_) => self.breaker.on_success(),
            Err(_) => self.breaker.on_error(),
        }
        report_breaker(&self.metrics, CHAIN, "poll", &self.breaker);
        result
    }

    async fn poll_head_and_catch_up(&self) -> Result<ScanReport, WatcherError> {
        let head = self.client.block_number().await?;
        self.sink.emit(RawEvent::chain_head(CHAIN, head)).await?;
        self.catch_up(head).await
    }

    /// Scans from the checkpoint towards `head - confirmations` in batches,
    /// persisting the checkpoint after each one.
    pub async fn catch_up(&self, head: u64) -> Result<ScanReport, WatcherError> {
        let key = CHAIN.checkpoint_key();
        let checkpoint = store::get_u64(self.store.as_ref(), &key).await?;
        let Some((range, target)) = catch_up_range(
            checkpoint,
            head,
            self.confirmations,
            self.settings.safety_margin,
            self.settings.max_backfill,
        ) else {
            return Ok(ScanReport {
                head,
                ..Default::default()
            });
        };

        let mut emitted = 0;
        for batch in batches(range.clone(), self.settings.batch_size) {
            emitted += self.scan_live(batch.clone()).await?;
            advance_checkpoint(
                self.store.as_ref(),
                &self.metrics,
                CHAIN,
                &key,
                "live",
                *batch.end(),
            )
            .await?;
            tracing::info!(
                chain = %CHAIN,
                from = batch.start(),
                to = batch.end(),
                emitted,
                "scanned batch"
            );
        }

        Ok(ScanReport {
            head,
            backlog: *range.end() < target,
            scanned: Some(range),
            emitted,
        })
    }

    async fn scan_live(&self, blocks: RangeInclusive<u64>) -> Result<usize, WatcherError> {
        if self.settings.contracts.is_empty() {
            return Ok(0);
        }
        let filter_topics = self.settings.contracts.iter().all(|c| !c.topics.is_empty());
        let query = LogQuery {
            addresses: self.settings.contracts.iter().map(|c| c.address).collect(),
            topics: if filter_topics {
                self.settings
                    .contracts
                    .iter()
                    .flat_map(|c| c.topics.iter().copied())
                    .collect()
            } else {
                vec![]
            },
            from_block: *blocks.start(),
            to_block: *blocks.end(),
        };

        let mut emitted = 0;
        for log in self.client.get_logs(&query).await? {
            let Some(contract) = self.contract(&log.address) else {
                continue;
            };
            let wanted = contract.topics.is_empty()
                || log.topics.first().is_some_and(|t| contract.topics.contains(t));
            if !wanted {
                continue;
            }
            self.emit_log(log, self.event_type(contract), "abi").await?;
            emitted += 1;
        }
        Ok(emitted)
    }

    fn contract(&self, address: &Address) -> Option<&EvmContractSettings> {
        self.settings.contracts.iter().find(|c| &c.address == address)
    }

    fn event_type(&self, contract: &EvmContractSettings) -> EventKind {
        contract
            .event_type
            .unwrap_or(self.settings.default_event_type)
    }

    /// Emits the decoded log, or its raw form if decoding fails.
    async fn emit_log(&self, log: EvmLog, kind: EventKind, stage: &str) -> Result<(), WatcherError> {
        let payload = if self.decoder.is_empty() {
            raw_payload(&log, None)
        } else {
            match self.decoder.decode(&log) {
                Ok(payload) => payload,
                Err(err) => {
                    self.metrics
                        .decode_errors
                        .with_label_values(&[CHAIN.as_ref(), stage])
                        .inc();
                    tracing::debug!(address = %log.address, err = %err, "emitting undecoded log");
                    raw_payload(&log, Some(&err))
                }
            }
        };

        let mut raw = RawEvent::new(CHAIN, kind, payload);
        raw.block_number = log.block_number;
        raw.tx_hash = log.tx_hash.map(|hash| hash.to_string());
        raw.log_index = log.log_index;
        self.sink.emit(raw).await?;
        Ok(())
    }

    /// Runs the startup backfill, then polls until stopped. A failed poll
    /// never ends the loop.
    #[instrument(name = "evm_watcher", skip_all, level = "info")]
    pub async fn run(self: Arc<Self>) {
        tracing::info!(contracts = self.settings.contracts.len(), "evm watcher started");
        if let Err(err) = self.backfill_history().await {
            self.breaker.on_error();
            tracing::error!(err = ?err, "historical backfill failed");
        }

        let mut poll = AdaptivePoll::new(&self.settings.poll);
        while !self.cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(report) if report.backlog => poll.faster(),
                Ok(_) => poll.slower(),
                Err(WatcherError::CircuitOpen) => {
                    tracing::debug!("circuit open, skipping poll");
                    poll.slower();
                }
                Err(err) => {
                    tracing::warn!(err = ?err, "poll failed");
                    poll.slower();
                }
            }
            self.sleep(poll.interval()).await;
        }
        tracing::info!("evm watcher stopped");
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        settings::{CircuitBreakerSettings, HistoricalStart},
        store::MemoryStateStore,
        test_utils::{MockEvmClient, RecordingSink, evm_log},
    };
    use alloy::primitives::address;
    use pretty_assertions::assert_eq;

    const BRIDGE: Address = address!("0x00000000000000000000000000000000000000aa");

    fn settings() -> EvmSettings {
        let mut settings: EvmSettings = serde_json::from_value(serde_json::json!({
            "rpc_url": "http://localhost:8545",
            "contracts": [{"address": BRIDGE.to_string()}],
        }))
        .unwrap();
        settings.batch_size = 20;
        settings.circuit_breaker = CircuitBreakerSettings {
            window_errors: 2,
            reset_after: Duration::from_secs(60),
        };
        settings
    }

    struct Harness {
        client: Arc<MockEvmClient>,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryStateStore>,
        watcher: EvmWatcher,
    }

    fn harness(settings: EvmSettings) -> Harness {
        let client = Arc::new(MockEvmClient::default());
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryStateStore::default());
        let watcher = EvmWatcher::new(
            client.clone(),
            sink.clone(),
            store.clone(),
            settings,
            2,
            CancellationToken::new(),
            Arc::new(Metrics::unregistered()),
        )
        .unwrap();
        Harness {
            client,
            sink,
            store,
            watcher,
        }
    }

    #[tokio::test]
    async fn catch_up_moves_forward_only() {
        let h = harness(settings());
        h.store.set("checkpoint:base", 100.into()).await.unwrap();
        h.client.push_log(evm_log(BRIDGE, 120, 0));
        h.client.push_log(evm_log(BRIDGE, 90, 0));

        let report = h.watcher.catch_up(152).await.unwrap();
        assert_eq!(report.scanned, Some(101..=150));
        assert_eq!(report.emitted, 1);
        assert!(!report.backlog);
        assert_eq!(
            store::get_u64(h.store.as_ref(), "checkpoint:base").await.unwrap(),
            Some(150)
        );
        let queried: Vec<_> = h.client.queries().iter().map(|q| (q.from_block, q.to_block)).collect();
        assert_eq!(queried, vec![(101, 120), (121, 140), (141, 150)]);

        let again = h.watcher.catch_up(152).await.unwrap();
        assert_eq!(again.scanned, None);
        assert!(h.client.queries().iter().skip(3).all(|q| q.from_block > 150));
        assert_eq!(h.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_keeps_earlier_progress() {
        let h = harness(settings());
        h.store.set("checkpoint:base", 100.into()).await.unwrap();
        h.client.fail_logs_from(Some(121));

        assert!(matches!(
            h.watcher.catch_up(152).await,
            Err(WatcherError::Rpc(_))
        ));
        assert_eq!(
            store::get_u64(h.store.as_ref(), "checkpoint:base").await.unwrap(),
            Some(120)
        );
    }

    #[tokio::test]
    async fn poll_emits_head_then_logs_and_keeps_undecodable_ones() {
        let h = harness(settings());
        h.client.set_head(1_000);
        h.store.set("checkpoint:base", 990.into()).await.unwrap();
        h.client.push_log(evm_log(BRIDGE, 995, 3));

        let report = h.watcher.poll_once().await.unwrap();
        assert_eq!(report.head, 1_000);

        let events = h.sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::ChainHead);
        assert_eq!(events[0].block_number, Some(1_000));
        assert_eq!(events[1].kind, EventKind::BridgeMessage);
        assert_eq!(events[1].log_index, Some(3));
        assert_eq!(events[1].payload["address"], BRIDGE.to_string().to_lowercase());
        assert!(events[1].payload.contains_key("topics"));
    }

    #[tokio::test]
    async fn repeated_failures_open_the_breaker() {
        let h = harness(settings());
        h.client.fail_block_number(true);

        assert!(matches!(h.watcher.poll_once().await, Err(WatcherError::Rpc(_))));
        assert!(matches!(h.watcher.poll_once().await, Err(WatcherError::Rpc(_))));
        assert_eq!(h.watcher.breaker_state(), BreakerState::Open);

        h.client.fail_block_number(false);
        assert!(matches!(
            h.watcher.poll_once().await,
            Err(WatcherError::CircuitOpen)
        ));
    }

    #[tokio::test]
    async fn auto_backfill_starts_behind_head_without_checkpoints() {
        let mut settings = settings();
        settings.historical_start = Some(HistoricalStart::Auto);
        settings.margin_confirmations = 100;
        settings.page_blocks = 50;
        let h = harness(settings);
        h.client.set_head(1_000);
        h.client.push_log(evm_log(BRIDGE, 950, 0));

        let emitted = h.watcher.backfill_history().await.unwrap();
        assert_eq!(emitted, 1);
        let queried: Vec<_> = h.client.queries().iter().map(|q| (q.from_block, q.to_block)).collect();
        assert_eq!(queried, vec![(900, 949), (950, 998)]);
        assert_eq!(
            store::get_u64(h.store.as_ref(), &contract_checkpoint_key(&BRIDGE))
                .await
                .unwrap(),
            Some(998)
        );

        // A second run resumes after the stored per-contract checkpoint.
        h.client.set_head(1_010);
        h.watcher.backfill_history().await.unwrap();
        assert_eq!(h.client.queries().last().map(|q| q.from_block), Some(999));
    }

    #[tokio::test]
    async fn stop_ends_the_run_loop() {
        let h = harness(settings());
        let watcher = Arc::new(h.watcher);
        let task = tokio::spawn(watcher.clone().run());
        watcher.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
