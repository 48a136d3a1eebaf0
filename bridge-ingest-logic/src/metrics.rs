use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    core::Collector,
};

/// Collectors of the ingestion core.
///
/// Built once against a caller supplied registry and handed to every
/// component as `Arc<Metrics>`. Labels stay low-cardinality: chain, event
/// type, rate-limit key and checkpoint scope.
#[derive(Clone)]
pub struct Metrics {
    /// Raw events handed to the sink, per chain and type.
    pub events_received: IntCounterVec,
    /// Decode failures per chain and stage (`abi`, `borsh`, `historical`, `subscription`).
    pub decode_errors: IntCounterVec,
    pub jobs_processed: IntCounterVec,
    pub jobs_failed: IntCounterVec,
    pub jobs_dead_lettered: IntCounterVec,
    pub jobs_rate_limited: IntCounterVec,
    pub apply_latency: HistogramVec,
    /// Last observed head per chain.
    pub chain_head: IntGaugeVec,
    /// Persisted checkpoint per chain and scope (`live` or a contract address).
    pub checkpoint: IntGaugeVec,
    /// 0 closed, 1 half-open, 2 open.
    pub circuit_breaker_state: IntGaugeVec,
    pub queue_inflight: IntGauge,
    pub messages_confirmed: IntCounterVec,
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C, prometheus::Error> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            events_received: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "bridge_ingest_events_received_total",
                        "raw events emitted into normalization",
                    ),
                    &["chain", "type"],
                )?,
            )?,
            decode_errors: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "bridge_ingest_decode_errors_total",
                        "logs emitted with a raw payload because decoding failed",
                    ),
                    &["chain", "stage"],
                )?,
            )?,
            jobs_processed: register(
                registry,
                IntCounterVec::new(
                    Opts::new("bridge_ingest_jobs_processed_total", "jobs acked"),
                    &["type"],
                )?,
            )?,
            jobs_failed: register(
                registry,
                IntCounterVec::new(
                    Opts::new("bridge_ingest_jobs_failed_total", "failed job deliveries"),
                    &["type"],
                )?,
            )?,
            jobs_dead_lettered: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "bridge_ingest_jobs_dead_lettered_total",
                        "jobs moved to the dead-letter store",
                    ),
                    &["type"],
                )?,
            )?,
            jobs_rate_limited: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "bridge_ingest_jobs_rate_limited_total",
                        "jobs rescheduled by the rate limiter",
                    ),
                    &["key"],
                )?,
            )?,
            apply_latency: register(
                registry,
                HistogramVec::new(
                    HistogramOpts::new(
                        "bridge_ingest_apply_latency_seconds",
                        "time spent applying one event to domain state",
                    )
                    .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
                    &["type"],
                )?,
            )?,
            chain_head: register(
                registry,
                IntGaugeVec::new(
                    Opts::new("bridge_ingest_chain_head", "latest observed block or slot"),
                    &["chain"],
                )?,
            )?,
            checkpoint: register(
                registry,
                IntGaugeVec::new(
                    Opts::new("bridge_ingest_checkpoint", "last scanned block or slot"),
                    &["chain", "scope"],
                )?,
            )?,
            circuit_breaker_state: register(
                registry,
                IntGaugeVec::new(
                    Opts::new(
                        "bridge_ingest_circuit_breaker_state",
                        "circuit breaker state: 0 closed, 1 half-open, 2 open",
                    ),
                    &["chain", "task"],
                )?,
            )?,
            queue_inflight: register(
                registry,
                IntGauge::new("bridge_ingest_queue_inflight", "jobs currently dispatched")?,
            )?,
            messages_confirmed: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "bridge_ingest_messages_confirmed_total",
                        "bridge messages that reached the required confirmations",
                    ),
                    &["chain"],
                )?,
            )?,
        })
    }

    /// Metrics bound to a fresh private registry.
    #[cfg(test)]
    pub(crate) fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("fresh registry has no conflicting collectors")
    }
}

pub(crate) fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_into_supplied_registry() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics
            .events_received
            .with_label_values(&["base", "TRANSFER"])
            .inc();

        let families = registry.gather();
        assert!(
            families
                .iter()
                .any(|f| f.get_name() == "bridge_ingest_events_received_total")
        );
        // a second set of collectors cannot claim the same names
        assert!(Metrics::new(&registry).is_err());
    }
}
