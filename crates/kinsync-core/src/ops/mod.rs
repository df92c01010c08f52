//! Node and edge mutations on cached family graphs.
//!
//! Each mutation reads the current snapshot from the `GraphCache`, writes a
//! new snapshot back through both cache tiers, and queues the matching
//! remote operation on the `SyncEngine`.

pub mod mutations;

pub use mutations::{GraphMutations, MutationPolicy, EDGES_TABLE, NODES_TABLE};
