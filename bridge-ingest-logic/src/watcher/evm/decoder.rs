use std::{collections::HashMap, path::Path};

use alloy::{
    dyn_abi::{DynSolValue, EventExt},
    json_abi::{Event, JsonAbi},
    primitives::B256,
};
use serde_json::{Value, json};

use super::client::EvmLog;
use crate::{error::DecodeError, types::Payload};

/// Event decoder built from ABI JSON files, indexed by topic0.
#[derive(Debug, Default, Clone)]
pub struct AbiDecoder {
    events: HashMap<B256, Event>,
}

impl AbiDecoder {
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, DecodeError> {
        let mut decoder = Self::default();
        for path in paths {
            let path = path.as_ref();
            let abi_file = |reason: String| DecodeError::AbiFile {
                path: path.display().to_string(),
                reason,
            };
            let content = std::fs::read_to_string(path).map_err(|err| abi_file(err.to_string()))?;
            let value: Value =
                serde_json::from_str(&content).map_err(|err| abi_file(err.to_string()))?;
            decoder
                .index(value)
                .map_err(|err| abi_file(err.to_string()))?;
        }
        tracing::info!(events = decoder.events.len(), "abi decoder loaded");
        Ok(decoder)
    }

    /// Accepts either a bare ABI array or an artifact with an `abi` field.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        let mut decoder = Self::default();
        decoder.index(value)?;
        Ok(decoder)
    }

    fn index(&mut self, value: Value) -> Result<(), serde_json::Error> {
        let abi = match value {
            Value::Object(mut artifact) if artifact.contains_key("abi") => artifact
                .remove("abi")
                .unwrap_or(Value::Array(vec![])),
            other => other,
        };
        let abi: JsonAbi = serde_json::from_value(abi)?;
        for event in abi.events() {
            self.events.insert(event.selector(), event.clone());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn can_decode(&self, topic0: &B256) -> bool {
        self.events.contains_key(topic0)
    }

    /// Decoded payload `{event_name, args, address}`. Numeric arguments are
    /// rendered as decimal strings to keep full precision.
    pub fn decode(&self, log: &EvmLog) -> Result<Payload, DecodeError> {
        let topic0 = log.topics.first().ok_or(DecodeError::NoTopics)?;
        let event = self
            .events
            .get(topic0)
            .ok_or_else(|| DecodeError::UnknownTopic(topic0.to_string()))?;
        let decoded = event
            .decode_log_parts(log.topics.iter().copied(), &log.data)
            .map_err(|err| DecodeError::Abi(err.to_string()))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut args = Payload::new();
        for (i, input) in event.inputs.iter().enumerate() {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            };
            let name = if input.name.is_empty() {
                format!("arg{i}")
            } else {
                input.name.clone()
            };
            args.insert(name, value.map(|v| to_json(&v)).unwrap_or(Value::Null));
        }

        let mut payload = Payload::new();
        payload.insert("event_name".into(), event.name.clone().into());
        payload.insert("args".into(), Value::Object(args));
        payload.insert("address".into(), format!("{:#x}", log.address).into());
        Ok(payload)
    }
}

/// Payload emitted when a log cannot be decoded, so that nothing is dropped.
pub fn raw_payload(log: &EvmLog, error: Option<&DecodeError>) -> Payload {
    let mut payload = Payload::new();
    payload.insert("address".into(), format!("{:#x}", log.address).into());
    payload.insert(
        "topics".into(),
        log.topics.iter().map(|t| Value::String(t.to_string())).collect(),
    );
    payload.insert("data".into(), log.data.to_string().into());
    if let Some(error) = error {
        payload.insert("decode_error".into(), error.to_string().into());
    }
    payload
}

fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Int(i, _) => json!(i.to_string()),
        DynSolValue::Uint(u, _) => json!(u.to_string()),
        DynSolValue::FixedBytes(word, size) => json!(format!("0x{}", hex::encode(&word[..*size]))),
        DynSolValue::Address(address) => json!(format!("{address:#x}")),
        DynSolValue::Bytes(bytes) => json!(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => json!(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        other => json!(format!("0x{}", hex::encode(other.abi_encode()))),
    }
}
