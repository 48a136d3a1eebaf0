use std::collections::HashMap;

use blockscout_service_launcher::{
    launcher::{ConfigSettings, MetricsSettings},
    tracing::{JaegerSettings, TracingSettings},
};
use bridge_ingest_logic::settings::{
    BackpressureSettings, ConfirmationSettings, EngineSettings, EvmSettings, LockSettings,
    QueueSettings, RateLimitSettings, ReplaySettings, SolanaSettings, StateSettings,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Absent disables the EVM watcher.
    #[serde(default)]
    pub evm: Option<EvmSettings>,
    /// Absent disables the Solana watcher.
    #[serde(default)]
    pub solana: Option<SolanaSettings>,
    #[serde(default)]
    pub queue: QueueSettings,
    /// Token buckets keyed by `{chain}:{type}`, e.g. `base:BRIDGE_MESSAGE`.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitSettings>,
    #[serde(default)]
    pub backpressure: BackpressureSettings,
    #[serde(default)]
    pub state: StateSettings,
    #[serde(default)]
    pub locks: LockSettings,
    #[serde(default)]
    pub confirmations: ConfirmationSettings,
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub tracing: TracingSettings,
    #[serde(default)]
    pub jaeger: JaegerSettings,
}

impl ConfigSettings for Settings {
    const SERVICE_NAME: &'static str = "BRIDGE_INGEST";

    fn validate(&self) -> anyhow::Result<()> {
        if self.backpressure.resume_threshold > self.backpressure.high_watermark_inflight {
            anyhow::bail!(
                "backpressure resume_threshold ({}) must not exceed high_watermark_inflight ({})",
                self.backpressure.resume_threshold,
                self.backpressure.high_watermark_inflight
            );
        }
        for (key, limit) in &self.rate_limits {
            if limit.refill_period().is_none() || limit.burst == 0 {
                anyhow::bail!("rate limit `{key}` needs a positive rps and burst");
            }
        }
        Ok(())
    }
}
