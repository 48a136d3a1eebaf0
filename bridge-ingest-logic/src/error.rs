use sea_orm::DbErr;
use thiserror::Error;

use crate::types::{Chain, EventKind};

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("raw event must be a json object")]
    NotAnObject,
    #[error("raw event is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown chain `{0}`")]
    UnknownChain(String),
    #[error("unknown event type `{0}`")]
    UnknownKind(String),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("payload does not match {kind}: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] DbErr),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compare-and-set on `{0}` did not converge")]
    Contention(String),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("db error: {0}")]
    Db(#[from] DbErr),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Error returned by an [`crate::EventSink`]. The event was not accepted and
/// the caller must not treat it as delivered.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("{kind} payload is missing `{field}`")]
    MissingField {
        kind: EventKind,
        field: &'static str,
    },
    #[error("invalid signature for agent `{0}`")]
    InvalidSignature(String),
    #[error("malformed signature material: {0}")]
    SignatureMaterial(String),
    #[error("timed out acquiring lock `{0}`")]
    LockTimeout(String),
    #[error("lost lock `{name}` (token {token}) while applying")]
    LockLost { name: String, token: u64 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid abi file {path}: {reason}")]
    AbiFile { path: String, reason: String },
    #[error("log has no topics")]
    NoTopics,
    #[error("no abi event matches topic {0}")]
    UnknownTopic(String),
    #[error("abi decode failed: {0}")]
    Abi(String),
    #[error("need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        offset: usize,
        need: usize,
        have: usize,
    },
    #[error("field `{field}` takes its length from unknown field `{reference}`")]
    UnknownLengthField { field: String, reference: String },
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error(transparent)]
    Rpc(#[from] anyhow::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("invalid replay range {from}..={to} for {chain} (max span {max_span})")]
    InvalidRange {
        chain: Chain,
        from: u64,
        to: u64,
        max_span: u64,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
}
