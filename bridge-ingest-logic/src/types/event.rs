use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use super::Chain;
use crate::error::NormalizeError;

pub type Payload = Map<String, Value>;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Transfer,
    OracleUpdate,
    AgentSignal,
    BridgeMessage,
    ChainHead,
}

/// Origin of an event. Exactly one of `block_number` / `slot` is meaningful,
/// depending on the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPointer {
    pub chain: Chain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_index: Option<u64>,
}

impl ChainPointer {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            block_number: None,
            slot: None,
            tx_hash: None,
            log_index: None,
        }
    }

    /// Block number for EVM pointers, slot for Solana pointers.
    pub fn position(&self) -> Option<u64> {
        match self.chain {
            Chain::Base => self.block_number,
            Chain::Solana => self.slot,
        }
    }
}

/// Event as produced by a watcher or the replay path, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub chain: Chain,
    pub kind: EventKind,
    pub block_number: Option<u64>,
    pub slot: Option<u64>,
    pub tx_hash: Option<String>,
    pub log_index: Option<u64>,
    pub payload: Payload,
}

impl RawEvent {
    pub fn new(chain: Chain, kind: EventKind, payload: Payload) -> Self {
        Self {
            chain,
            kind,
            block_number: None,
            slot: None,
            tx_hash: None,
            log_index: None,
            payload,
        }
    }

    pub fn with_block_number(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    pub fn with_slot(mut self, slot: u64) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_tx(mut self, tx_hash: impl Into<String>, log_index: Option<u64>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self.log_index = log_index;
        self
    }

    /// Synthetic head event for `chain` at `position`.
    pub fn chain_head(chain: Chain, position: u64) -> Self {
        let mut payload = Payload::new();
        payload.insert(chain.position_field().to_string(), position.into());
        let event = Self::new(chain, EventKind::ChainHead, payload);
        match chain {
            Chain::Base => event.with_block_number(position),
            Chain::Solana => event.with_slot(position),
        }
    }

    /// Builds a raw event from an untyped JSON object, as submitted by the
    /// admin path. `chain` and `type` are mandatory.
    pub fn from_json(value: Value) -> Result<Self, NormalizeError> {
        let Value::Object(mut map) = value else {
            return Err(NormalizeError::NotAnObject);
        };

        let chain = required_str(&map, "chain")?;
        let chain = chain
            .parse::<Chain>()
            .map_err(|_| NormalizeError::UnknownChain(chain))?;
        let kind = required_str(&map, "type")?;
        let kind = kind
            .parse::<EventKind>()
            .map_err(|_| NormalizeError::UnknownKind(kind))?;

        let payload = match map.remove("payload") {
            None | Some(Value::Null) => Payload::new(),
            Some(Value::Object(payload)) => payload,
            Some(other) => {
                return Err(NormalizeError::InvalidField {
                    field: "payload",
                    reason: format!("expected object, got {other}"),
                });
            }
        };
        let tx_hash = match map.get("tx_hash") {
            None | Some(Value::Null) => None,
            Some(Value::String(hash)) => Some(hash.clone()),
            Some(other) => Some(other.to_string()),
        };

        Ok(Self {
            chain,
            kind,
            block_number: optional_u64(&map, "block_number")?,
            slot: optional_u64(&map, "slot")?,
            tx_hash,
            log_index: optional_u64(&map, "log_index")?,
            payload,
        })
    }
}

fn required_str(map: &Payload, field: &'static str) -> Result<String, NormalizeError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(NormalizeError::MissingField(field)),
        Some(Value::String(s)) if s.is_empty() => Err(NormalizeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(NormalizeError::InvalidField {
            field,
            reason: format!("expected string, got {other}"),
        }),
    }
}

fn optional_u64(map: &Payload, field: &'static str) -> Result<Option<u64>, NormalizeError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_as_u64(value)
            .map(Some)
            .ok_or_else(|| NormalizeError::InvalidField {
                field,
                reason: format!("expected unsigned integer, got {value}"),
            }),
    }
}

/// Accepts JSON numbers as well as decimal or `0x`-prefixed strings.
pub(crate) fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        })
    }

    pub fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(Option::<Value>::deserialize(d)?
            .as_ref()
            .and_then(super::value_as_u64))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferPayload {
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub extra: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleUpdatePayload {
    #[serde(flatten)]
    pub values: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSignalPayload {
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Hex encoded ed25519 signature over `message`.
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessagePayload {
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, deserialize_with = "lenient::string", skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(flatten)]
    pub extra: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainHeadPayload {
    #[serde(default, deserialize_with = "lenient::u64", skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, deserialize_with = "lenient::u64", skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(flatten)]
    pub extra: Payload,
}

/// Typed body of a canonical event, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventBody {
    Transfer(TransferPayload),
    OracleUpdate(OracleUpdatePayload),
    AgentSignal(AgentSignalPayload),
    BridgeMessage(BridgeMessagePayload),
    ChainHead(ChainHeadPayload),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Transfer(_) => EventKind::Transfer,
            EventBody::OracleUpdate(_) => EventKind::OracleUpdate,
            EventBody::AgentSignal(_) => EventKind::AgentSignal,
            EventBody::BridgeMessage(_) => EventKind::BridgeMessage,
            EventBody::ChainHead(_) => EventKind::ChainHead,
        }
    }

    /// Decodes an untyped payload into the variant for `kind`. Unknown keys
    /// are kept in the payload's `extra` map.
    pub fn decode(kind: EventKind, payload: Payload) -> Result<Self, serde_json::Error> {
        let value = Value::Object(payload);
        Ok(match kind {
            EventKind::Transfer => EventBody::Transfer(serde_json::from_value(value)?),
            EventKind::OracleUpdate => EventBody::OracleUpdate(serde_json::from_value(value)?),
            EventKind::AgentSignal => EventBody::AgentSignal(serde_json::from_value(value)?),
            EventKind::BridgeMessage => EventBody::BridgeMessage(serde_json::from_value(value)?),
            EventKind::ChainHead => EventBody::ChainHead(serde_json::from_value(value)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: String,
    pub source: ChainPointer,
    pub observed_at: DateTime<Utc>,
    pub body: EventBody,
}

impl CanonicalEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn chain(&self) -> Chain {
        self.source.chain
    }

    /// Key used for per `{chain}:{type}` rate limiting.
    pub fn rate_limit_key(&self) -> String {
        format!("{}:{}", self.source.chain, self.kind())
    }
}
