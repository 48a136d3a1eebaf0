use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::DomainSnapshot;
use crate::{settings::ConfirmationSettings, types::Chain};

/// Stored under `head:<chain>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHeadRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChainHeadRecord {
    pub fn position(&self, chain: Chain) -> Option<u64> {
        match chain {
            Chain::Base => self.block_number,
            Chain::Solana => self.slot,
        }
    }

    /// Takes the max of the stored and the observed position.
    pub(crate) fn merge(&mut self, chain: Chain, observed: u64, now: DateTime<Utc>) {
        let slot = match chain {
            Chain::Base => &mut self.block_number,
            Chain::Solana => &mut self.slot,
        };
        *slot = Some(slot.map_or(observed, |stored| stored.max(observed)));
        self.updated_at = Some(now);
    }
}

/// Marks every pending message whose origin chain head has reached
/// `position + required` as confirmed. Linear in the number of tracked
/// messages. Returns the chains of the newly confirmed messages.
pub(crate) fn sweep(
    snapshot: &mut DomainSnapshot,
    heads: &HashMap<Chain, u64>,
    confirmations: &ConfirmationSettings,
    now: DateTime<Utc>,
) -> Vec<Chain> {
    let mut confirmed = Vec::new();
    for message in snapshot.messages.iter_mut().filter(|m| !m.confirmed) {
        let chain = message.source.chain;
        let (Some(position), Some(&head)) = (message.source.position(), heads.get(&chain)) else {
            continue;
        };
        if head >= position.saturating_add(confirmations.required(chain)) {
            message.confirmed = true;
            message.confirmed_at = Some(now);
            confirmed.push(chain);
        }
    }
    confirmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::bridge_message,
        types::{BridgeMessagePayload, EventBody},
    };
    use chrono::TimeDelta;

    fn snapshot_with(events: &[crate::types::CanonicalEvent]) -> DomainSnapshot {
        let mut snapshot = DomainSnapshot::default();
        for event in events {
            let EventBody::BridgeMessage(payload) = &event.body else {
                panic!("expected a bridge message");
            };
            snapshot.add_message(event, payload);
        }
        snapshot
    }

    #[test]
    fn head_merge_keeps_the_maximum() {
        let now = Utc::now();
        let mut head = ChainHeadRecord::default();
        head.merge(Chain::Base, 10, now);
        head.merge(Chain::Base, 7, now);
        assert_eq!(head.position(Chain::Base), Some(10));
        assert_eq!(head.position(Chain::Solana), None);
    }

    #[test]
    fn sweep_uses_per_chain_requirements() {
        let base = bridge_message(Chain::Base, 100, "0xaa");
        let solana = bridge_message(Chain::Solana, 500, "sig");
        let mut snapshot = snapshot_with(&[base.clone(), solana.clone()]);
        let confirmations = ConfirmationSettings::default();
        let now = Utc::now();

        let heads = HashMap::from([(Chain::Base, 101), (Chain::Solana, 501)]);
        assert_eq!(sweep(&mut snapshot, &heads, &confirmations, now), vec![Chain::Solana]);
        assert!(!snapshot.message(&base.id).unwrap().confirmed);

        let later = now + TimeDelta::seconds(5);
        let heads = HashMap::from([(Chain::Base, 102), (Chain::Solana, 600)]);
        assert_eq!(sweep(&mut snapshot, &heads, &confirmations, later), vec![Chain::Base]);
        assert_eq!(snapshot.message(&solana.id).unwrap().confirmed_at, Some(now));
        assert_eq!(snapshot.message(&base.id).unwrap().confirmed_at, Some(later));
    }

    #[test]
    fn message_without_position_is_never_confirmed() {
        let mut event = bridge_message(Chain::Base, 1, "0x01");
        event.source.block_number = None;
        let mut snapshot = DomainSnapshot::default();
        snapshot.add_message(&event, &BridgeMessagePayload::default());
        let heads = HashMap::from([(Chain::Base, u64::MAX)]);
        assert!(sweep(&mut snapshot, &heads, &ConfirmationSettings::default(), Utc::now()).is_empty());
    }
}
