//! Fixtures and in-process fakes shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use alloy::primitives::{Address, B256, Bytes, keccak256};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    error::SinkError,
    normalizer::{EventSink, normalize},
    queue::JobHandler,
    types::{CanonicalEvent, Chain, EventKind, Payload, RawEvent},
    watcher::{
        evm::{EvmClient, EvmLog, LogQuery},
        solana::{LogsNotification, LogsStream, SolanaClient},
    },
};

/// Bridge message observed at `position` (block or slot, depending on the
/// chain). Distinct positions give distinct ids even for the same tx.
pub fn bridge_message(chain: Chain, position: u64, tx_hash: &str) -> CanonicalEvent {
    let mut payload = Payload::new();
    payload.insert("direction".into(), json!("base_to_solana"));
    payload.insert("asset".into(), json!("USDC"));
    payload.insert("amount".into(), json!("1000"));
    payload.insert("nonce".into(), json!(position));
    let raw = RawEvent::new(chain, EventKind::BridgeMessage, payload).with_tx(tx_hash, None);
    let raw = match chain {
        Chain::Base => raw.with_block_number(position),
        Chain::Solana => raw.with_slot(position),
    };
    normalize(raw, Utc::now()).expect("bridge message fixture normalizes")
}

pub fn chain_head(chain: Chain, position: u64) -> CanonicalEvent {
    normalize(RawEvent::chain_head(chain, position), Utc::now()).expect("head fixture normalizes")
}

#[derive(Default)]
pub struct RecordingHandler {
    fail_with: Option<String>,
    handled: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl RecordingHandler {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Ids of the events handled successfully, in order.
    pub fn handled_ids(&self) -> Vec<String> {
        self.handled.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, event: &CanonicalEvent) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{message}");
        }
        self.handled.lock().push(event.id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RawEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<RawEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, raw: RawEvent) -> Result<(), SinkError> {
        self.events.lock().push(raw);
        Ok(())
    }
}

/// Log emitted by `address` at `block`, with a deterministic tx hash.
pub fn evm_log(address: Address, block: u64, log_index: u64) -> EvmLog {
    EvmLog {
        address,
        topics: vec![keccak256("MessageSent(bytes32,uint256)")],
        data: Bytes::from(vec![0u8; 32]),
        block_number: Some(block),
        tx_hash: Some(B256::left_padding_from(&block.to_be_bytes())),
        log_index: Some(log_index),
    }
}

#[derive(Default)]
struct MockEvmState {
    head: u64,
    logs: Vec<EvmLog>,
    queries: Vec<LogQuery>,
    fail_block_number: bool,
    fail_logs_from: Option<u64>,
}

/// In-memory chain answering `eth_blockNumber` and `eth_getLogs`.
#[derive(Default)]
pub struct MockEvmClient {
    state: Mutex<MockEvmState>,
}

impl MockEvmClient {
    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    pub fn push_log(&self, log: EvmLog) {
        self.state.lock().logs.push(log);
    }

    pub fn queries(&self) -> Vec<LogQuery> {
        self.state.lock().queries.clone()
    }

    pub fn fail_block_number(&self, fail: bool) {
        self.state.lock().fail_block_number = fail;
    }

    /// Fails every log query starting at or after `block`.
    pub fn fail_logs_from(&self, block: Option<u64>) {
        self.state.lock().fail_logs_from = block;
    }
}

#[async_trait]
impl EvmClient for MockEvmClient {
    async fn block_number(&self) -> anyhow::Result<u64> {
        let state = self.state.lock();
        if state.fail_block_number {
            anyhow::bail!("rpc unavailable");
        }
        Ok(state.head)
    }

    async fn get_logs(&self, query: &LogQuery) -> anyhow::Result<Vec<EvmLog>> {
        let mut state = self.state.lock();
        state.queries.push(query.clone());
        if state
            .fail_logs_from
            .is_some_and(|from| query.from_block >= from)
        {
            anyhow::bail!("getLogs failed for {}..={}", query.from_block, query.to_block);
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .is_some_and(|b| (query.from_block..=query.to_block).contains(&b))
            })
            .filter(|log| query.addresses.is_empty() || query.addresses.contains(&log.address))
            .filter(|log| {
                query.topics.is_empty()
                    || log.topics.first().is_some_and(|t| query.topics.contains(t))
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct MockSolanaState {
    slot: u64,
    subscriptions: VecDeque<Vec<LogsNotification>>,
    subscribe_calls: usize,
}

/// Each `subscribe_logs` call replays the next queued batch of
/// notifications and then drops, like a lost connection. With nothing
/// queued the subscription fails outright.
#[derive(Default)]
pub struct MockSolanaClient {
    state: Mutex<MockSolanaState>,
}

impl MockSolanaClient {
    pub fn set_slot(&self, slot: u64) {
        self.state.lock().slot = slot;
    }

    pub fn push_subscription(&self, notifications: Vec<LogsNotification>) {
        self.state.lock().subscriptions.push_back(notifications);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }
}

#[async_trait]
impl SolanaClient for MockSolanaClient {
    async fn get_slot(&self) -> anyhow::Result<u64> {
        Ok(self.state.lock().slot)
    }

    async fn subscribe_logs(&self, _program_ids: &[String]) -> anyhow::Result<LogsStream> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        let Some(notifications) = state.subscriptions.pop_front() else {
            anyhow::bail!("connection refused");
        };
        let items: Vec<anyhow::Result<LogsNotification>> =
            notifications.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}
