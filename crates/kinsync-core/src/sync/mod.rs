//! Offline-first synchronization.
//!
//! - `OperationQueue`: durable list of pending remote mutations
//! - `SyncEngine`: drains the queue against the remote, one call at a time,
//!   with bounded retries, and publishes status to subscribers
//! - `ConnectivityMonitor` / `NetworkMonitor`: online state and how it is probed

pub mod connectivity;
pub mod engine;
pub mod queue;

pub use connectivity::{ConnectivityMonitor, NetworkMonitor};
pub use engine::{Backoff, DrainReport, EngineConfig, RetryPolicy, SyncEngine, Unsubscribe};
pub use queue::OperationQueue;
