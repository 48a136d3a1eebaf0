//! Chain watchers turn upstream RPC data into raw events.
//!
//! Both watchers share the same catch-up contract: the stored checkpoint
//! only ever moves forward, scanning stops `confirmations` behind the head,
//! and progress is persisted after every batch.

pub mod evm;
pub mod solana;

use std::ops::RangeInclusive;

use crate::{
    error::StoreError,
    metrics::{Metrics, gauge_value},
    resilience::CircuitBreaker,
    store::{self, StateStore},
    types::Chain,
};

/// Result of one catch-up step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub head: u64,
    /// Positions scanned during this step, if any.
    pub scanned: Option<RangeInclusive<u64>>,
    pub emitted: usize,
    /// The confirmed target is still ahead of the checkpoint.
    pub backlog: bool,
}

/// Range a catch-up step should scan, or `None` when already caught up.
///
/// Without a stored checkpoint the scan starts `confirmations +
/// safety_margin` behind the head. A single step never covers more than
/// `max_backfill` positions.
pub(crate) fn catch_up_range(
    checkpoint: Option<u64>,
    head: u64,
    confirmations: u64,
    safety_margin: u64,
    max_backfill: u64,
) -> Option<(RangeInclusive<u64>, u64)> {
    let confirmed = head.saturating_sub(confirmations);
    let checkpoint =
        checkpoint.unwrap_or_else(|| head.saturating_sub(confirmations.saturating_add(safety_margin)));
    let target = checkpoint.max(confirmed);
    if target <= checkpoint {
        return None;
    }
    let end = target.min(checkpoint.saturating_add(max_backfill.max(1)));
    Some((checkpoint + 1..=end, target))
}

/// Splits `range` into consecutive chunks of at most `size` positions.
pub(crate) fn batches(range: RangeInclusive<u64>, size: u64) -> impl Iterator<Item = RangeInclusive<u64>> {
    let size = size.max(1);
    let (start, end) = range.into_inner();
    let mut next = Some(start).filter(|start| *start <= end);
    std::iter::from_fn(move || {
        let from = next?;
        let to = from.saturating_add(size - 1).min(end);
        next = to.checked_add(1).filter(|n| *n <= end);
        Some(from..=to)
    })
}

/// Moves a checkpoint forward and mirrors it into the metrics.
pub(crate) async fn advance_checkpoint(
    store: &dyn StateStore,
    metrics: &Metrics,
    chain: Chain,
    key: &str,
    scope: &str,
    value: u64,
) -> Result<u64, StoreError> {
    let stored = store::advance_max(store, key, value).await?;
    metrics
        .checkpoint
        .with_label_values(&[chain.as_ref(), scope])
        .set(gauge_value(stored));
    Ok(stored)
}

pub(crate) fn report_breaker(metrics: &Metrics, chain: Chain, task: &str, breaker: &CircuitBreaker) {
    metrics
        .circuit_breaker_state
        .with_label_values(&[chain.as_ref(), task])
        .set(breaker.state().gauge());
}
