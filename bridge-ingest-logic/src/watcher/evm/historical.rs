use alloy::primitives::Address;

use super::{CHAIN, EvmWatcher, LogQuery};
use crate::{
    error::WatcherError,
    settings::{EvmContractSettings, HistoricalStart},
    store,
    watcher::{advance_checkpoint, batches},
};

pub fn contract_checkpoint_key(address: &Address) -> String {
    format!("checkpoint:{CHAIN}:{address:#x}")
}

impl EvmWatcher {
    /// Paginated scan of one contract over `from..=to`, persisting the
    /// contract checkpoint after every page. Emits no `CHAIN_HEAD`.
    pub async fn historical_scan(
        &self,
        contract: &EvmContractSettings,
        from: u64,
        to: u64,
    ) -> Result<usize, WatcherError> {
        let key = contract_checkpoint_key(&contract.address);
        let scope = format!("{:#x}", contract.address);
        let kind = self.event_type(contract);

        let mut emitted = 0;
        for page in batches(from..=to, self.settings.page_blocks) {
            if self.cancel.is_cancelled() {
                break;
            }
            let query = LogQuery {
                addresses: vec![contract.address],
                topics: contract.topics.clone(),
                from_block: *page.start(),
                to_block: *page.end(),
            };
            for log in self.client.get_logs(&query).await? {
                self.emit_log(log, kind, "historical").await?;
                emitted += 1;
            }
            advance_checkpoint(
                self.store.as_ref(),
                &self.metrics,
                CHAIN,
                &key,
                &scope,
                *page.end(),
            )
            .await?;
            tracing::debug!(contract = scope, from = page.start(), to = page.end(), "historical page scanned");
        }
        Ok(emitted)
    }

    /// Covers each contract from its configured start to the confirmed head,
    /// skipping what its checkpoint already covers.
    pub async fn backfill_history(&self) -> Result<usize, WatcherError> {
        let contracts = &self.settings.contracts;
        let enabled = self.settings.historical_start.is_some()
            || contracts.iter().any(|c| c.start_block.is_some());
        if !enabled {
            return Ok(0);
        }

        let head = self.client.block_number().await?;
        let to = head.saturating_sub(self.confirmations);
        let default_start = match self.settings.historical_start {
            Some(HistoricalStart::Block(block)) => Some(block),
            Some(HistoricalStart::Auto) => Some(self.auto_start(head).await?),
            None => None,
        };

        let mut emitted = 0;
        for contract in contracts {
            let Some(start) = contract.start_block.or(default_start) else {
                continue;
            };
            let checkpoint =
                store::get_u64(self.store.as_ref(), &contract_checkpoint_key(&contract.address))
                    .await?;
            let from = checkpoint.map_or(start, |cp| start.max(cp.saturating_add(1)));
            if from > to {
                continue;
            }
            tracing::info!(contract = %contract.address, from, to, "historical backfill");
            emitted += self.historical_scan(contract, from, to).await?;
        }
        Ok(emitted)
    }

    /// Minimum of the existing per-contract checkpoints, or
    /// `head - margin_confirmations` when none exist yet.
    async fn auto_start(&self, head: u64) -> Result<u64, WatcherError> {
        let mut min: Option<u64> = None;
        for contract in &self.settings.contracts {
            let key = contract_checkpoint_key(&contract.address);
            if let Some(cp) = store::get_u64(self.store.as_ref(), &key).await? {
                min = Some(min.map_or(cp, |m| m.min(cp)));
            }
        }
        Ok(min.unwrap_or_else(|| head.saturating_sub(self.settings.margin_confirmations)))
    }
}
