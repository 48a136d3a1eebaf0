use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Chains the ingestion core knows how to watch.
///
/// The string form (`base`, `solana`) is what ends up in state keys, event
/// ids, metric labels and rate-limit keys, so it must stay stable.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chain {
    /// EVM-style chain, positions are block numbers.
    Base,
    /// Solana-style chain, positions are slots.
    Solana,
}

impl Chain {
    /// Name of the position a pointer on this chain carries.
    pub fn position_field(&self) -> &'static str {
        match self {
            Chain::Base => "block_number",
            Chain::Solana => "slot",
        }
    }

    pub fn head_key(&self) -> String {
        format!("head:{self}")
    }

    pub fn checkpoint_key(&self) -> String {
        format!("checkpoint:{self}")
    }
}
