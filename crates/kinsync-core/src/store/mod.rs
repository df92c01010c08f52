//! Durable key-value storage behind the cache and the operation queue.
//!
//! `KeyValueStore` is the only persistence seam the core depends on. Two
//! implementations ship with the crate:
//! - `MemoryStore`: process-local map, for tests and ephemeral sessions
//! - `FileStore`: one JSON file per key in a data directory
//!
//! Keys are namespaced by prefix (`graph.` for family snapshots, `op.` for
//! queued operations) so both components can share one store.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;
}

/// Load and deserialize a value, `None` if the key is absent.
pub async fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SyncError::persistence(&format!("Failed to parse stored value {}", key), e)),
        None => Ok(None),
    }
}

/// Serialize and store a value.
pub async fn save<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    store.set(key, value).await
}

/// Keys in `store` that start with `prefix`, with the prefix stripped.
pub async fn keys_with_prefix(store: &dyn KeyValueStore, prefix: &str) -> Result<Vec<String>> {
    Ok(store
        .keys()
        .await?
        .into_iter()
        .filter_map(|k| k.strip_prefix(prefix).map(str::to_string))
        .collect())
}
