mod chain;
mod event;
mod job;

pub use chain::Chain;
pub(crate) use event::value_as_u64;
pub use event::{
    AgentSignalPayload, BridgeMessagePayload, CanonicalEvent, ChainHeadPayload, ChainPointer,
    EventBody, EventKind, OracleUpdatePayload, Payload, RawEvent, TransferPayload,
};
pub use job::{DeadLetter, JobEnvelope};
