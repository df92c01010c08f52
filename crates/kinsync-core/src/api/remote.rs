use async_trait::async_trait;
use serde_json::Value;

use super::ApiError;
use crate::models::FamilyGraph;

/// The remote authoritative store, as consumed by the cache and the sync engine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert(&self, table: &str, data: &Value) -> Result<Value, ApiError>;

    async fn update(&self, table: &str, id: &str, data: &Value) -> Result<Value, ApiError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), ApiError>;

    /// Current graph for a family, `None` if the remote has never seen it.
    async fn fetch_graph(&self, family_id: &str) -> Result<Option<FamilyGraph>, ApiError>;
}

/// Remote used when no endpoint is configured. Every call fails as unavailable,
/// so queued operations stay pending until a real remote is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectedRemote;

#[async_trait]
impl RemoteStore for DisconnectedRemote {
    async fn insert(&self, table: &str, _data: &Value) -> Result<Value, ApiError> {
        Err(ApiError::Unavailable(format!("no remote configured for {}", table)))
    }

    async fn update(&self, table: &str, _id: &str, _data: &Value) -> Result<Value, ApiError> {
        Err(ApiError::Unavailable(format!("no remote configured for {}", table)))
    }

    async fn delete(&self, table: &str, _id: &str) -> Result<(), ApiError> {
        Err(ApiError::Unavailable(format!("no remote configured for {}", table)))
    }

    async fn fetch_graph(&self, _family_id: &str) -> Result<Option<FamilyGraph>, ApiError> {
        Err(ApiError::Unavailable("no remote configured".to_string()))
    }
}
