//! Data models for family graphs and sync bookkeeping.
//!
//! This module contains the data structures shared by the cache, the
//! mutation operations and the sync engine:
//!
//! - `FamilyGraph`, `FamilyNode`, `FamilyEdge`: the relationship graph
//! - `SyncOperation` and its enums: one durable pending remote mutation
//! - `SyncStatus`: the snapshot published to subscribers

pub mod graph;
pub mod operation;

pub use graph::{EdgeInput, FamilyEdge, FamilyGraph, FamilyNode, NodeInput, NodeType, RelationshipKind};
pub use operation::{NewOperation, OperationKind, OperationStatus, Priority, SyncOperation, SyncStatus};
