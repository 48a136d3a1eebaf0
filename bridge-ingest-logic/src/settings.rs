use std::{collections::HashMap, path::PathBuf, time::Duration};

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Deserializer, de::Error as _};
use serde_json::Value;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use url::Url;

use crate::{
    types::{Chain, EventKind, value_as_u64},
    watcher::solana::ProgramLayout,
};

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PollSettings {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_poll_min_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_interval: Duration,
    #[serde(default = "default_poll_max_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_poll_min_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_poll_max_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            min_interval: default_poll_min_interval(),
            max_interval: default_poll_max_interval(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_window_errors")]
    pub window_errors: u32,
    #[serde(default = "default_reset_after")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reset_after: Duration,
}

fn default_window_errors() -> u32 {
    5
}

fn default_reset_after() -> Duration {
    Duration::from_secs(20)
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            window_errors: default_window_errors(),
            reset_after: default_reset_after(),
        }
    }
}

/// Where the startup historical backfill of a contract begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoricalStart {
    /// Minimum of the existing per-contract checkpoints, or
    /// `head - margin_confirmations` when there are none.
    Auto,
    Block(u64),
}

impl<'de> Deserialize<'de> for HistoricalStart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) if s.eq_ignore_ascii_case("auto") => Ok(HistoricalStart::Auto),
            value => value_as_u64(&value)
                .map(HistoricalStart::Block)
                .ok_or_else(|| D::Error::custom(format!("expected \"auto\" or a block number, got {value}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EvmContractSettings {
    pub address: Address,
    /// Topic0 filter; empty means every event of the contract.
    #[serde(default)]
    pub topics: Vec<B256>,
    /// Overrides [`EvmSettings::default_event_type`] for this contract.
    #[serde(default)]
    pub event_type: Option<EventKind>,
    /// Overrides [`EvmSettings::historical_start`] for this contract.
    #[serde(default)]
    pub start_block: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EvmSettings {
    pub rpc_url: Url,
    #[serde(default)]
    pub contracts: Vec<EvmContractSettings>,
    #[serde(default)]
    pub abi_files: Vec<PathBuf>,
    #[serde(default = "default_evm_event_type")]
    pub default_event_type: EventKind,
    #[serde(default = "default_evm_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_evm_max_backfill")]
    pub max_backfill: u64,
    #[serde(default = "default_evm_safety_margin")]
    pub safety_margin: u64,
    #[serde(default = "default_page_blocks")]
    pub page_blocks: u64,
    /// Startup backfill start. Absent disables the startup backfill.
    #[serde(default)]
    pub historical_start: Option<HistoricalStart>,
    #[serde(default = "default_margin_confirmations")]
    pub margin_confirmations: u64,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

fn default_evm_event_type() -> EventKind {
    EventKind::BridgeMessage
}

fn default_evm_batch_size() -> u64 {
    500
}

fn default_evm_max_backfill() -> u64 {
    5_000
}

fn default_evm_safety_margin() -> u64 {
    10
}

fn default_page_blocks() -> u64 {
    2_000
}

fn default_margin_confirmations() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SolanaSettings {
    pub rpc_url: Url,
    pub ws_url: Url,
    #[serde(default)]
    pub program_ids: Vec<String>,
    /// Event layouts keyed by program id.
    #[serde(default)]
    pub layouts: HashMap<String, ProgramLayout>,
    #[serde(default = "default_solana_event_type")]
    pub default_event_type: EventKind,
    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_solana_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_solana_max_backfill")]
    pub max_backfill: u64,
    #[serde(default = "default_solana_safety_margin")]
    pub safety_margin: u64,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

fn default_solana_event_type() -> EventKind {
    EventKind::AgentSignal
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

fn default_solana_batch_size() -> u64 {
    1_000
}

fn default_solana_max_backfill() -> u64 {
    10_000
}

fn default_solana_safety_margin() -> u64 {
    32
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum QueueBackendSettings {
    Memory {
        /// How long acked jobs are remembered for deduplication.
        #[serde(default = "default_acked_retention")]
        #[serde_as(as = "DurationSeconds<u64>")]
        acked_retention: Duration,
    },
    Sqlite {
        #[serde(default = "default_queue_sqlite_url")]
        url: String,
    },
    Redis {
        url: String,
        #[serde(default = "default_queue_namespace")]
        namespace: String,
        /// How long acked jobs are remembered for deduplication.
        #[serde(default = "default_acked_retention")]
        #[serde_as(as = "DurationSeconds<u64>")]
        acked_retention: Duration,
    },
}

fn default_queue_sqlite_url() -> String {
    "sqlite://.runtime/bridge_queue.db?mode=rwc".to_string()
}

fn default_queue_namespace() -> String {
    "bridge".to_string()
}

fn default_acked_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

impl Default for QueueBackendSettings {
    fn default() -> Self {
        QueueBackendSettings::Sqlite {
            url: default_queue_sqlite_url(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QueueSettings {
    #[serde(default)]
    pub backend: QueueBackendSettings,
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_rate_limit_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub rate_limit_delay: Duration,
    #[serde(default = "default_backoff_cap")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub backoff_cap: Duration,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_batch() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    5
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_rate_limit_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(60)
}

fn default_worker_count() -> usize {
    1
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: Default::default(),
            batch: default_batch(),
            max_attempts: default_max_attempts(),
            tick_interval: default_tick_interval(),
            rate_limit_delay: default_rate_limit_delay(),
            backoff_cap: default_backoff_cap(),
            worker_count: default_worker_count(),
        }
    }
}

/// Token bucket for one `{chain}:{type}` key.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    pub rps: f64,
    pub burst: u32,
}

impl RateLimitSettings {
    /// Time to refill one token. `None` when `rps` is not positive or so
    /// small that the period does not fit a `Duration`.
    pub fn refill_period(&self) -> Option<Duration> {
        if self.rps > 0.0 {
            Duration::try_from_secs_f64(1.0 / self.rps).ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackpressureSettings {
    #[serde(default = "default_high_watermark")]
    pub high_watermark_inflight: usize,
    #[serde(default = "default_resume_threshold")]
    pub resume_threshold: usize,
}

fn default_high_watermark() -> usize {
    200
}

fn default_resume_threshold() -> usize {
    120
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            high_watermark_inflight: default_high_watermark(),
            resume_threshold: default_resume_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum StateSettings {
    Memory,
    Sqlite {
        #[serde(default = "default_state_sqlite_url")]
        url: String,
    },
}

fn default_state_sqlite_url() -> String {
    "sqlite://.runtime/bridge_state.db?mode=rwc".to_string()
}

impl Default for StateSettings {
    fn default() -> Self {
        StateSettings::Sqlite {
            url: default_state_sqlite_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum LockBackendSettings {
    Local,
    Redis {
        url: String,
        #[serde(default = "default_lock_namespace")]
        namespace: String,
    },
}

fn default_lock_namespace() -> String {
    "bridge".to_string()
}

impl Default for LockBackendSettings {
    fn default() -> Self {
        LockBackendSettings::Local
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LockSettings {
    #[serde(default)]
    pub backend: LockBackendSettings,
    #[serde(default = "default_lock_ttl")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ttl: Duration,
    #[serde(default = "default_acquire_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub acquire_timeout: Duration,
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: Default::default(),
            ttl: default_lock_ttl(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfirmationSettings {
    #[serde(default = "default_base_confirmations")]
    pub base: u64,
    #[serde(default = "default_solana_confirmations")]
    pub solana: u64,
}

fn default_base_confirmations() -> u64 {
    2
}

fn default_solana_confirmations() -> u64 {
    1
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            base: default_base_confirmations(),
            solana: default_solana_confirmations(),
        }
    }
}

impl ConfirmationSettings {
    pub fn required(&self, chain: Chain) -> u64 {
        match chain {
            Chain::Base => self.base,
            Chain::Solana => self.solana,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReplaySettings {
    #[serde(default = "default_base_max_span")]
    pub base_max_span: u64,
    #[serde(default = "default_solana_max_span")]
    pub solana_max_span: u64,
}

fn default_base_max_span() -> u64 {
    5_000
}

fn default_solana_max_span() -> u64 {
    10_000
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            base_max_span: default_base_max_span(),
            solana_max_span: default_solana_max_span(),
        }
    }
}

impl ReplaySettings {
    pub fn max_span(&self, chain: Chain) -> u64 {
        match chain {
            Chain::Base => self.base_max_span,
            Chain::Solana => self.solana_max_span,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default = "default_verify_signatures")]
    pub verify_signatures: bool,
}

fn default_verify_signatures() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            verify_signatures: default_verify_signatures(),
        }
    }
}
