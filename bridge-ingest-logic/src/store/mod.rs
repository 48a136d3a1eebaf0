//! Key/value state shared by the watchers and the state engine.
//!
//! Every multi-writer key is mutated through [`compare_and_set`](StateStore::compare_and_set)
//! so that concurrent watchers, queue workers and the replay path never lose
//! an update. Monotonic values (checkpoints, heads) go through
//! [`advance_max`], structured values through [`update`].

mod memory;
mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{error::StoreError, settings::StateSettings, types::value_as_u64};

const MAX_CAS_ATTEMPTS: usize = 64;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Writes `new` only if the stored value equals `expected` (`None` meaning
    /// the key is absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> Result<bool, StoreError>;
}

pub async fn store_from_settings(settings: &StateSettings) -> Result<Arc<dyn StateStore>, StoreError> {
    Ok(match settings {
        StateSettings::Memory => Arc::new(MemoryStateStore::default()),
        StateSettings::Sqlite { url } => Arc::new(SqliteStateStore::connect(url).await?),
    })
}

pub async fn get_u64<S: StateStore + ?Sized>(store: &S, key: &str) -> Result<Option<u64>, StoreError> {
    Ok(store.get(key).await?.as_ref().and_then(value_as_u64))
}

/// Raises the integer under `key` to `candidate` unless it is already
/// higher. Returns the value stored afterwards.
pub async fn advance_max<S: StateStore + ?Sized>(
    store: &S,
    key: &str,
    candidate: u64,
) -> Result<u64, StoreError> {
    for _ in 0..MAX_CAS_ATTEMPTS {
        let current = store.get(key).await?;
        if let Some(stored) = current.as_ref().and_then(value_as_u64) {
            if stored >= candidate {
                return Ok(stored);
            }
        }
        if store
            .compare_and_set(key, current.as_ref(), candidate.into())
            .await?
        {
            return Ok(candidate);
        }
    }
    Err(StoreError::Contention(key.to_string()))
}

/// Administrative reset. The only operation allowed to move a checkpoint
/// backwards.
pub async fn reset_checkpoint<S: StateStore + ?Sized>(
    store: &S,
    key: &str,
    value: u64,
) -> Result<(), StoreError> {
    tracing::warn!(key, value, "resetting checkpoint");
    store.set(key, value.into()).await
}

/// Read-modify-write of a typed value with CAS retries.
///
/// `f` may run several times under contention, so it must not have side
/// effects outside the value it is given. Nothing is written when `f` leaves
/// the value unchanged.
pub async fn update<S, T, R, E, F>(store: &S, key: &str, mut f: F) -> Result<R, E>
where
    S: StateStore + ?Sized,
    T: Serialize + DeserializeOwned + Default,
    E: From<StoreError>,
    F: FnMut(&mut T) -> Result<R, E>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let current = store.get(key).await?;
        let mut value: T = match &current {
            Some(v) => serde_json::from_value(v.clone()).map_err(StoreError::from)?,
            None => T::default(),
        };
        let before = match &current {
            Some(v) => v.clone(),
            None => serde_json::to_value(&value).map_err(StoreError::from)?,
        };

        let out = f(&mut value)?;
        let next = serde_json::to_value(&value).map_err(StoreError::from)?;
        if next == before {
            return Ok(out);
        }
        if store.compare_and_set(key, current.as_ref(), next).await? {
            return Ok(out);
        }
        tracing::debug!(key, "compare-and-set conflict, retrying");
    }
    Err(StoreError::Contention(key.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[tokio::test]
    async fn advance_max_never_regresses() {
        let store = MemoryStateStore::default();
        assert_eq!(advance_max(&store, "checkpoint:base", 150).await.unwrap(), 150);
        assert_eq!(advance_max(&store, "checkpoint:base", 100).await.unwrap(), 150);
        assert_eq!(get_u64(&store, "checkpoint:base").await.unwrap(), Some(150));

        reset_checkpoint(&store, "checkpoint:base", 90).await.unwrap();
        assert_eq!(get_u64(&store, "checkpoint:base").await.unwrap(), Some(90));
    }

    #[derive(Default, Serialize, Deserialize)]
    struct Counter {
        n: u64,
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryStateStore::default());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    update::<_, Counter, _, StoreError, _>(&*store, "counter", |c| {
                        c.n += 1;
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let value = store.get("counter").await.unwrap().unwrap();
        assert_eq!(value["n"], 16);
    }

    #[tokio::test]
    async fn unchanged_update_writes_nothing() {
        let store = MemoryStateStore::default();
        update::<_, Counter, _, StoreError, _>(&store, "counter", |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(store.get("counter").await.unwrap(), None);
    }
}
