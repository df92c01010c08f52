//! Local caching of family graphs for offline access.
//!
//! This module provides the `GraphCache`, a two-tier cache: an in-memory map
//! in front of a durable `KeyValueStore`. Reads fall through memory, then the
//! store, then (while online) the remote authority. Writes go to both tiers.
//!
//! Snapshots are persisted under `graph.<family_id>` together with the time
//! they were cached.

pub mod manager;

pub use manager::{CachedData, GraphCache, GRAPH_KEY_PREFIX};
