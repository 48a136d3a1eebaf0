mod database;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metrics;
mod normalizer;
pub mod queue;
mod replay;
pub mod resilience;
pub mod settings;
pub mod store;
#[cfg(test)]
mod test_utils;
pub mod types;
pub mod watcher;

pub use database::connect_sqlite;
pub use engine::StateEngine;
pub use metrics::Metrics;
pub use normalizer::{EventRouter, EventSink, event_id, normalize};
pub use queue::JobQueue;
pub use replay::ReplayService;
pub use watcher::{ScanReport, evm::EvmWatcher, solana::SolanaWatcher};
