//! Operator-triggered reprocessing.
//!
//! A replay never reads the chain itself. It pushes a synthetic head at the
//! end of the range through the regular sink so that the usual catch-up and
//! confirmation machinery (idempotent by construction) does the work.

use std::sync::Arc;

use crate::{
    error::ReplayError,
    normalizer::EventSink,
    settings::ReplaySettings,
    types::{Chain, RawEvent},
};

pub struct ReplayService {
    sink: Arc<dyn EventSink>,
    settings: ReplaySettings,
}

impl ReplayService {
    pub fn new(sink: Arc<dyn EventSink>, settings: ReplaySettings) -> Self {
        Self { sink, settings }
    }

    pub async fn replay(&self, chain: Chain, from: u64, to: u64) -> Result<(), ReplayError> {
        let max_span = self.settings.max_span(chain);
        if to < from || to - from > max_span {
            return Err(ReplayError::InvalidRange {
                chain,
                from,
                to,
                max_span,
            });
        }

        tracing::info!(%chain, from, to, "replay requested");
        self.sink.emit(RawEvent::chain_head(chain, to)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::RecordingSink, types::EventKind};
    use pretty_assertions::assert_eq;

    fn service() -> (Arc<RecordingSink>, ReplayService) {
        let sink = Arc::new(RecordingSink::default());
        (sink.clone(), ReplayService::new(sink, ReplaySettings::default()))
    }

    #[tokio::test]
    async fn emits_synthetic_head_at_range_end() {
        let (sink, service) = service();
        service.replay(Chain::Solana, 100, 10_100).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ChainHead);
        assert_eq!(events[0].slot, Some(10_100));
        assert_eq!(events[0].payload["slot"], 10_100);
    }

    #[tokio::test]
    async fn rejects_inverted_and_oversized_ranges() {
        let (sink, service) = service();
        assert!(matches!(
            service.replay(Chain::Base, 10, 9).await,
            Err(ReplayError::InvalidRange { max_span: 5_000, .. })
        ));
        assert!(matches!(
            service.replay(Chain::Base, 0, 5_001).await,
            Err(ReplayError::InvalidRange { .. })
        ));
        service.replay(Chain::Base, 0, 5_000).await.unwrap();
        assert_eq!(sink.events().len(), 1);
    }
}
