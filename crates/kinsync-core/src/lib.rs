//! kinsync core - offline-first family graph cache and sync queue.
//!
//! Clients edit a locally cached family graph while disconnected; every edit
//! is written through a two-tier cache and recorded as a durable operation
//! that the sync engine replays against the remote store once connectivity
//! returns.
//!
//! - `models`: graph and operation types
//! - `store`: the `KeyValueStore` persistence seam and its implementations
//! - `cache`: the two-tier `GraphCache`
//! - `ops`: node/edge mutations (`GraphMutations`)
//! - `sync`: the `OperationQueue`, `SyncEngine` and connectivity tracking
//! - `api`: the `RemoteStore` contract and its HTTP client
//! - `app`: wiring of all of the above
//! - `config`: on-disk configuration

pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod ops;
pub mod store;
pub mod sync;

pub use api::{ApiError, DisconnectedRemote, HttpRemote, RemoteStore};
pub use app::{App, AppSettings};
pub use cache::GraphCache;
pub use config::Config;
pub use error::{Result, SyncError};
pub use models::{
    EdgeInput, FamilyEdge, FamilyGraph, FamilyNode, NewOperation, NodeInput, NodeType, OperationKind,
    OperationStatus, Priority, RelationshipKind, SyncOperation, SyncStatus,
};
pub use ops::{GraphMutations, MutationPolicy};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{ConnectivityMonitor, DrainReport, EngineConfig, NetworkMonitor, SyncEngine};
