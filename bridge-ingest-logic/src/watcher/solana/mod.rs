//! Watcher of the Solana-style chain.
//!
//! Two independently cancellable tasks share only the sink and the store:
//! head polling (`CHAIN_HEAD` plus checkpoint advancement over confirmed
//! slots) and the live `logsSubscribe` stream of the configured programs.
//! Each task has its own circuit breaker.

mod client;
mod decoder;

pub use client::{LogsNotification, LogsStream, RpcSolanaClient, SolanaClient};
pub use decoder::{
    DiscriminatorType, FieldLayout, FieldType, LayoutDecoder, ProgramLayout, VariantLayout,
    program_data,
};

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use super::{ScanReport, advance_checkpoint, batches, catch_up_range, report_breaker};
use crate::{
    error::WatcherError,
    metrics::Metrics,
    normalizer::EventSink,
    resilience::{AdaptivePoll, BreakerState, CircuitBreaker},
    settings::SolanaSettings,
    store::{self, StateStore},
    types::{Chain, Payload, RawEvent},
};

const CHAIN: Chain = Chain::Solana;

pub struct SolanaWatcher {
    client: Arc<dyn SolanaClient>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn StateStore>,
    decoder: LayoutDecoder,
    settings: SolanaSettings,
    confirmations: u64,
    breaker: CircuitBreaker,
    subscription_breaker: CircuitBreaker,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl SolanaWatcher {
    pub fn new(
        client: Arc<dyn SolanaClient>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn StateStore>,
        settings: SolanaSettings,
        confirmations: u64,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Self {
        let decoder = LayoutDecoder::new(settings.layouts.clone());
        let breaker = CircuitBreaker::new(&settings.circuit_breaker);
        let subscription_breaker = CircuitBreaker::new(&settings.circuit_breaker);
        Self {
            client,
            sink,
            store,
            decoder,
            settings,
            confirmations,
            breaker,
            subscription_breaker,
            cancel,
            metrics,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// State of the head polling breaker.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn subscription_breaker_state(&self) -> BreakerState {
        self.subscription_breaker.state()
    }

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
        let slot = self.client.get_slot().await?;
        self.sink.emit(RawEvent::chain_head(CHAIN, slot)).await?;
        self.catch_up(slot).await
    }

    /// Advances `checkpoint:solana` towards `slot - confirmations` in
    /// batches. Program logs of those slots arrive through the live
    /// subscription, so nothing is fetched here.
    pub async fn catch_up(&self, slot: u64) -> Result<ScanReport, WatcherError> {
        let key = CHAIN.checkpoint_key();
        let checkpoint = store::get_u64(self.store.as_ref(), &key).await?;
        let Some((range, target)) = catch_up_range(
            checkpoint,
            slot,
            self.confirmations,
            self.settings.safety_margin,
            self.settings.max_backfill,
        ) else {
            return Ok(ScanReport {
                head: slot,
                ..Default::default()
            });
        };

        for batch in batches(range.clone(), self.settings.batch_size) {
            advance_checkpoint(
                self.store.as_ref(),
                &self.metrics,
                CHAIN,
                &key,
                "live",
                *batch.end(),
            )
            .await?;
        }
        tracing::debug!(chain = %CHAIN, from = range.start(), to = range.end(), "checkpoint advanced");

        Ok(ScanReport {
            head: slot,
            backlog: *range.end() < target,
            scanned: Some(range),
            emitted: 0,
        })
    }

    /// Emits one event per `Program data:` line of the notification, or a
    /// single event carrying the raw logs when there is none. Failed
    /// transactions are skipped.
    pub async fn handle_notification(&self, notification: LogsNotification) -> Result<usize, WatcherError> {
        if notification.failed {
            tracing::debug!(signature = %notification.signature, "skipping failed transaction");
            return Ok(0);
        }

        let data = program_data(&notification.logs);
        let payloads: Vec<Payload> = if data.is_empty() {
            let mut payload = Payload::new();
            payload.insert("program_id".into(), notification.program_id.clone().into());
            payload.insert(
                "logs".into(),
                notification.logs.iter().cloned().map(Value::String).collect(),
            );
            vec![payload]
        } else {
            data.iter()
                .map(|data| self.decode_program_data(&notification.program_id, data))
                .collect()
        };

        let emitted = payloads.len();
        for (index, payload) in payloads.into_iter().enumerate() {
            let raw = RawEvent::new(CHAIN, self.settings.default_event_type, payload)
                .with_slot(notification.slot)
                .with_tx(notification.signature.clone(), Some(index as u64));
            self.sink.emit(raw).await?;
        }
        Ok(emitted)
    }

    fn decode_program_data(&self, program_id: &str, data: &str) -> Payload {
        let mut payload = match self.decoder.decode_base64(program_id, data) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                let mut raw = Payload::new();
                raw.insert("data".into(), data.into());
                raw
            }
            Err(err) => {
                self.metrics
                    .decode_errors
                    .with_label_values(&[CHAIN.as_ref(), "borsh"])
                    .inc();
                tracing::debug!(program_id, err = %err, "emitting undecoded program data");
                let mut raw = Payload::new();
                raw.insert("data".into(), data.into());
                raw.insert("decode_error".into(), err.to_string().into());
                raw
            }
        };
        payload.insert("program_id".into(), program_id.into());
        payload
    }

    /// Spawns the head polling and subscription tasks and waits for both.
    #[instrument(name = "solana_watcher", skip_all, level = "info")]
    pub async fn run(self: Arc<Self>) {
        tracing::info!(programs = self.settings.program_ids.len(), "solana watcher started");
        let head = tokio::spawn(self.clone().run_head_poll().in_current_span());
        let subscription = tokio::spawn(self.clone().run_subscription().in_current_span());
        for (task, handle) in [("head poll", head), ("subscription", subscription)] {
            if let Err(err) = handle.await {
                tracing::error!(task, err = ?err, "watcher task panicked");
            }
        }
        tracing::info!("solana watcher stopped");
    }

    async fn run_head_poll(self: Arc<Self>) {
        let mut poll = AdaptivePoll::new(&self.settings.poll);
        while !self.cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(report) if report.backlog => poll.faster(),
                Ok(_) => poll.slower(),
                Err(WatcherError::CircuitOpen) => poll.slower(),
                Err(err) => {
                    tracing::warn!(err = ?err, "slot poll failed");
                    poll.slower();
                }
            }
            self.sleep(poll.interval()).await;
        }
    }

    /// Keeps a log subscription open, reconnecting after the adaptive poll
    /// interval whenever it drops.
    async fn run_subscription(self: Arc<Self>) {
        if self.settings.program_ids.is_empty() {
            tracing::info!("no programs configured, log subscription disabled");
            return;
        }
        let mut poll = AdaptivePoll::new(&self.settings.poll);
        while !self.cancel.is_cancelled() {
            if !self.subscription_breaker.allow() {
                report_breaker(&self.metrics, CHAIN, "subscription", &self.subscription_breaker);
                self.sleep(poll.interval()).await;
                continue;
            }
            match self.stream_logs(&mut poll).await {
                Ok(()) => break,
                Err(err) => {
                    self.subscription_breaker.on_error();
                    report_breaker(&self.metrics, CHAIN, "subscription", &self.subscription_breaker);
                    poll.slower();
                    tracing::warn!(err = ?err, retry_in = ?poll.interval(), "log subscription dropped");
                    self.sleep(poll.interval()).await;
                }
            }
        }
    }

    /// Returns `Ok` only when cancelled.
    async fn stream_logs(&self, poll: &mut AdaptivePoll) -> Result<(), WatcherError> {
        let mut stream = self
            .client
            .subscribe_logs(&self.settings.program_ids)
            .await?;
        self.subscription_breaker.on_success();
        report_breaker(&self.metrics, CHAIN, "subscription", &self.subscription_breaker);
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(notification)) => {
                    self.handle_notification(notification).await?;
                    poll.reset();
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Err(anyhow::anyhow!("log subscription ended").into()),
            }
        }
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
        store::MemoryStateStore,
        test_utils::{MockSolanaClient, RecordingSink},
        types::EventKind,
    };
    use base64::{Engine, engine::general_purpose::STANDARD};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const PROGRAM: &str = "Agent1111111111111111111111111111111111111";

    fn settings() -> SolanaSettings {
        settings_with(json!({}))
    }

    fn settings_with(overrides: serde_json::Value) -> SolanaSettings {
        let mut settings = json!({
            "rpc_url": "http://localhost:8899",
            "ws_url": "ws://localhost:8900",
            "program_ids": [PROGRAM],
            "batch_size": 100,
            "max_backfill": 300,
            "poll": {"interval": 10, "min_interval": 5, "max_interval": 20},
            "layouts": {
                PROGRAM: {
                    "discriminator": "u8",
                    "variants": {
                        "1": {"name": "Signal", "fields": [
                            {"name": "len", "type": "u8"},
                            {"name": "signal", "type": "bytes_len", "ref": "len"}
                        ]}
                    }
                }
            }
        });
        if let (Some(settings), serde_json::Value::Object(overrides)) = (settings.as_object_mut(), overrides) {
            settings.extend(overrides);
        }
        serde_json::from_value(settings).unwrap()
    }

    fn watcher(client: Arc<MockSolanaClient>, sink: Arc<RecordingSink>) -> (Arc<MemoryStateStore>, SolanaWatcher) {
        watcher_with(client, sink, settings())
    }

    fn watcher_with(
        client: Arc<MockSolanaClient>,
        sink: Arc<RecordingSink>,
        settings: SolanaSettings,
    ) -> (Arc<MemoryStateStore>, SolanaWatcher) {
        let store = Arc::new(MemoryStateStore::default());
        let watcher = SolanaWatcher::new(
            client,
            sink,
            store.clone(),
            settings,
            1,
            CancellationToken::new(),
            Arc::new(Metrics::unregistered()),
        );
        (store, watcher)
    }

    fn notification(logs: Vec<String>) -> LogsNotification {
        LogsNotification {
            program_id: PROGRAM.into(),
            signature: "sig-1".into(),
            slot: 500,
            logs,
            failed: false,
        }
    }

    #[tokio::test]
    async fn notification_data_is_decoded_per_line() {
        let sink = Arc::new(RecordingSink::default());
        let (_, watcher) = watcher(Arc::new(MockSolanaClient::default()), sink.clone());
        let ping = STANDARD.encode([1, 4, b'P', b'I', b'N', b'G']);
        let logs = vec![
            format!("Program data: {ping}"),
            "Program data: !!notbase64".to_string(),
        ];

        assert_eq!(watcher.handle_notification(notification(logs)).await.unwrap(), 2);
        let events = sink.events();
        assert_eq!(events[0].kind, EventKind::AgentSignal);
        assert_eq!(events[0].slot, Some(500));
        assert_eq!(events[0].tx_hash.as_deref(), Some("sig-1"));
        assert_eq!(events[0].log_index, Some(0));
        assert_eq!(events[0].payload["signal"], "PING");
        assert_eq!(events[0].payload["program_id"], PROGRAM);
        assert_eq!(events[1].log_index, Some(1));
        assert!(events[1].payload.contains_key("decode_error"));
    }

    #[tokio::test]
    async fn plain_logs_and_failed_transactions() {
        let sink = Arc::new(RecordingSink::default());
        let (_, watcher) = watcher(Arc::new(MockSolanaClient::default()), sink.clone());

        let logs = vec!["Program log: hello".to_string()];
        assert_eq!(watcher.handle_notification(notification(logs.clone())).await.unwrap(), 1);
        assert_eq!(sink.events()[0].payload["logs"], json!(logs));

        let mut failed = notification(vec!["Program data: AQ==".into()]);
        failed.failed = true;
        assert_eq!(watcher.handle_notification(failed).await.unwrap(), 0);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn catch_up_is_bounded_and_forward_only() {
        let sink = Arc::new(RecordingSink::default());
        let (store, watcher) = watcher(Arc::new(MockSolanaClient::default()), sink);
        store.set("checkpoint:solana", 1_000.into()).await.unwrap();

        let report = watcher.catch_up(2_001).await.unwrap();
        assert_eq!(report.scanned, Some(1_001..=1_300));
        assert!(report.backlog);
        assert_eq!(
            store::get_u64(store.as_ref(), "checkpoint:solana").await.unwrap(),
            Some(1_300)
        );

        let behind = watcher.catch_up(900).await.unwrap();
        assert_eq!(behind.scanned, None);
        assert_eq!(
            store::get_u64(store.as_ref(), "checkpoint:solana").await.unwrap(),
            Some(1_300)
        );
    }

    #[tokio::test]
    async fn run_streams_reconnects_and_stops() {
        let client = Arc::new(MockSolanaClient::default());
        client.set_slot(10);
        client.push_subscription(vec![notification(vec!["Program log: a".into()])]);
        client.push_subscription(vec![notification(vec!["Program log: b".into()])]);
        let sink = Arc::new(RecordingSink::default());
        let (_, watcher) = watcher(client.clone(), sink.clone());
        let watcher = Arc::new(watcher);
        let task = tokio::spawn(watcher.clone().run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.subscribe_calls() < 2
                || sink.events().iter().filter(|e| e.kind != EventKind::ChainHead).count() < 2
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        watcher.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(sink
            .events()
            .iter()
            .any(|e| e.kind == EventKind::ChainHead && e.slot == Some(10)));
    }

    #[tokio::test]
    async fn failing_subscription_does_not_stall_heads() {
        let client = Arc::new(MockSolanaClient::default());
        client.set_slot(10);
        let sink = Arc::new(RecordingSink::default());
        let settings = settings_with(json!({
            "circuit_breaker": {"window_errors": 1, "reset_after": 60}
        }));
        let (_, watcher) = watcher_with(client.clone(), sink.clone(), settings);
        let watcher = Arc::new(watcher);
        let task = tokio::spawn(watcher.clone().run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while watcher.subscription_breaker_state() != BreakerState::Open {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        client.set_slot(20);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !sink
                .events()
                .iter()
                .any(|e| e.kind == EventKind::ChainHead && e.slot == Some(20))
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(watcher.breaker_state(), BreakerState::Closed);
        assert_eq!(client.subscribe_calls(), 1);
        watcher.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn quiet_subscription_closes_its_breaker() {
        let client = Arc::new(MockSolanaClient::default());
        client.set_slot(10);
        client.push_subscription(Vec::new());
        let sink = Arc::new(RecordingSink::default());
        let settings = settings_with(json!({
            "circuit_breaker": {"window_errors": 1, "reset_after": 60}
        }));
        let (_, watcher) = watcher_with(client.clone(), sink, settings);
        let mut poll = AdaptivePoll::new(&watcher.settings.poll);

        watcher.subscription_breaker.on_error();
        assert_eq!(watcher.subscription_breaker_state(), BreakerState::Open);
        // the queued stream is empty, so it ends right after connecting
        assert!(watcher.stream_logs(&mut poll).await.is_err());
        assert_eq!(watcher.subscription_breaker_state(), BreakerState::Closed);
    }
}
