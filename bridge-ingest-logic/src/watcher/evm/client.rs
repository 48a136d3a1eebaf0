use alloy::{
    primitives::{Address, B256, Bytes},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::eth::{Filter, Log},
};
use async_trait::async_trait;
use url::Url;

/// A log as the watcher needs it, independent of the RPC client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub tx_hash: Option<B256>,
    pub log_index: Option<u64>,
}

impl From<Log> for EvmLog {
    fn from(log: Log) -> Self {
        Self {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            block_number: log.block_number,
            tx_hash: log.transaction_hash,
            log_index: log.log_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub addresses: Vec<Address>,
    /// Accepted topic0 values; empty means any.
    pub topics: Vec<B256>,
    pub from_block: u64,
    pub to_block: u64,
}

#[async_trait]
pub trait EvmClient: Send + Sync {
    async fn block_number(&self) -> anyhow::Result<u64>;

    async fn get_logs(&self, query: &LogQuery) -> anyhow::Result<Vec<EvmLog>>;
}

pub struct AlloyEvmClient {
    provider: DynProvider,
}

impl AlloyEvmClient {
    pub fn new(rpc_url: Url) -> Self {
        let provider = ProviderBuilder::new().connect_http(rpc_url).erased();
        Self { provider }
    }
}

#[async_trait]
impl EvmClient for AlloyEvmClient {
    async fn block_number(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_logs(&self, query: &LogQuery) -> anyhow::Result<Vec<EvmLog>> {
        let mut filter = Filter::new()
            .address(query.addresses.clone())
            .from_block(query.from_block)
            .to_block(query.to_block);
        if !query.topics.is_empty() {
            filter = filter.event_signature(query.topics.clone());
        }
        let logs = self.provider.get_logs(&filter).await?;
        tracing::debug!(
            from = query.from_block,
            to = query.to_block,
            count = logs.len(),
            "fetched logs"
        );
        Ok(logs.into_iter().map(EvmLog::from).collect())
    }
}
