use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AgentSignalPayload, BridgeMessagePayload, CanonicalEvent, Chain, ChainPointer,
    OracleUpdatePayload, Payload, TransferPayload,
};

pub(crate) const SNAPSHOT_KEY: &str = "snapshot";

const DEFAULT_AGENT_ID: &str = "unknown";
const DEFAULT_SIGNAL: &str = "LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub last_signal: String,
    pub last_seen: DateTime<Utc>,
    pub chain: Chain,
}

/// A bridge message waiting for its origin chain to reach finality.
/// `pending -> confirmed` is the only transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: String,
    pub direction: Option<String>,
    pub asset: Option<String>,
    pub amount: Option<String>,
    pub source: ChainPointer,
    pub observed_at: DateTime<Utc>,
    pub confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub asset: Option<String>,
    pub amount: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub source: ChainPointer,
    pub observed_at: DateTime<Utc>,
}

/// Everything the engine derives from applied events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentStatus>,
    #[serde(default)]
    pub messages: Vec<PendingMessage>,
    #[serde(default)]
    pub transfers: Vec<TransferRecord>,
    #[serde(default)]
    pub oracle: Payload,
}

impl DomainSnapshot {
    pub fn message(&self, id: &str) -> Option<&PendingMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub(crate) fn record_agent_signal(
        &mut self,
        event: &CanonicalEvent,
        payload: &AgentSignalPayload,
        now: DateTime<Utc>,
    ) {
        let agent_id = payload
            .agent_id
            .clone()
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
        let last_signal = payload
            .signal
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SIGNAL.to_string());
        self.agents.insert(
            agent_id,
            AgentStatus {
                last_signal,
                last_seen: now,
                chain: event.chain(),
            },
        );
    }

    /// Returns `false` if a message with the same id is already tracked.
    pub(crate) fn add_message(&mut self, event: &CanonicalEvent, payload: &BridgeMessagePayload) -> bool {
        if self.message(&event.id).is_some() {
            return false;
        }
        self.messages.push(PendingMessage {
            id: event.id.clone(),
            direction: payload.direction.clone(),
            asset: payload.asset.clone(),
            amount: payload.amount.clone(),
            source: event.source.clone(),
            observed_at: event.observed_at,
            confirmed: false,
            confirmed_at: None,
        });
        true
    }

    pub(crate) fn add_transfer(&mut self, event: &CanonicalEvent, payload: &TransferPayload) {
        if self.transfers.iter().any(|t| t.id == event.id) {
            return;
        }
        self.transfers.push(TransferRecord {
            id: event.id.clone(),
            asset: payload.asset.clone(),
            amount: payload.amount.clone(),
            from: payload.from.clone(),
            to: payload.to.clone(),
            source: event.source.clone(),
            observed_at: event.observed_at,
        });
    }

    pub(crate) fn merge_oracle(&mut self, payload: &OracleUpdatePayload) {
        for (key, value) in &payload.values {
            self.oracle.insert(key.clone(), value.clone());
        }
    }
}
