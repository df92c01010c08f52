//! Error taxonomy for the sync core.

use thiserror::Error;

use crate::api::ApiError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A family graph, node or edge is absent.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A remote call failed. Retryable up to the engine's attempt bound.
    #[error("Remote operation failed: {0}")]
    Remote(#[from] ApiError),

    /// A local durable write or read failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An edge names an endpoint missing from the local graph.
    #[error("Invalid edge: {0}")]
    InvalidEdge(String),
}

impl SyncError {
    pub fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        SyncError::Persistence(format!("{}: {}", context, err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    /// Remote failures that may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Remote(api) if api.is_transient())
    }
}
