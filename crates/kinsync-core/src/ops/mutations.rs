use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::GraphCache;
use crate::error::{Result, SyncError};
use crate::models::graph::Attributes;
use crate::models::{EdgeInput, FamilyEdge, FamilyGraph, FamilyNode, NewOperation, NodeInput, Priority};
use crate::sync::SyncEngine;

/// Remote table holding graph nodes.
pub const NODES_TABLE: &str = "family_graph_nodes";

/// Remote table holding graph edges.
pub const EDGES_TABLE: &str = "family_graph_edges";

/// Behaviour switches for cases where the remote contract is undecided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationPolicy {
    /// Queue a delete for every edge removed by a node-delete cascade, instead
    /// of relying on the remote to cascade.
    pub queue_cascaded_edge_deletes: bool,
    /// Reject `add_edge` when either endpoint is missing from the local graph.
    pub validate_edge_endpoints: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodePayload<'a> {
    family_id: &'a str,
    node: &'a FamilyNode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EdgePayload<'a> {
    family_id: &'a str,
    edge: &'a FamilyEdge,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeDeletePayload<'a> {
    family_id: &'a str,
    node_id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EdgeDeletePayload<'a> {
    family_id: &'a str,
    edge_id: Uuid,
}

/// Mutation entry points. Mutations on the same family run one at a time so
/// a read-modify-write never loses a concurrent change; different families
/// proceed independently.
/// Clone is cheap - clones share the cache, the engine and the family locks.
#[derive(Clone)]
pub struct GraphMutations {
    cache: GraphCache,
    engine: SyncEngine,
    policy: MutationPolicy,
    family_locks: Arc<FamilyLocks>,
}

type FamilyLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

fn lock_map(locks: &FamilyLocks) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    match locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Held for the duration of one mutation. Dropping the last holder of a
/// family's lock removes it from the map.
struct FamilyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<AsyncMutex<()>>,
    family_id: String,
    locks: Arc<FamilyLocks>,
}

impl Drop for FamilyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        // One reference in the map, one here; any more means someone is waiting
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.family_id);
        }
    }
}

impl GraphMutations {
    pub fn new(cache: GraphCache, engine: SyncEngine, policy: MutationPolicy) -> Self {
        Self {
            cache,
            engine,
            policy,
            family_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &MutationPolicy {
        &self.policy
    }

    async fn lock_family(&self, family_id: &str) -> FamilyGuard {
        let lock = Arc::clone(lock_map(&self.family_locks).entry(family_id.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        FamilyGuard {
            guard: Some(guard),
            lock,
            family_id: family_id.to_string(),
            locks: Arc::clone(&self.family_locks),
        }
    }

    pub async fn get_family_graph(&self, family_id: &str) -> Result<FamilyGraph> {
        self.cache.get(family_id).await
    }

    /// Append a node. A missing id is generated and a missing type defaults to person.
    pub async fn add_node(&self, family_id: &str, input: NodeInput) -> Result<FamilyNode> {
        let _guard = self.lock_family(family_id).await;
        let graph = self.cache.get(family_id).await?;

        let node = input.into_node();
        self.cache.put(family_id, graph.with_node(node.clone())).await?;

        let payload = serde_json::to_value(NodePayload { family_id, node: &node })?;
        self.engine
            .queue(NewOperation::insert(NODES_TABLE, payload).with_record_id(node.id).with_priority(Priority::Medium))
            .await?;

        info!(family_id, node_id = %node.id, "Node added");
        Ok(node)
    }

    /// Shallow-merge `partial` into the node's data. The queued update carries
    /// the whole merged node, so the last writer wins at node granularity.
    pub async fn update_node(&self, family_id: &str, node_id: Uuid, partial: Attributes) -> Result<FamilyNode> {
        let _guard = self.lock_family(family_id).await;
        let graph = self.cache.get(family_id).await?;

        let mut node = graph.node(node_id).cloned().ok_or(SyncError::NotFound("node"))?;
        node.merge_data(partial);
        self.cache.put(family_id, graph.with_replaced_node(node.clone())).await?;

        let payload = serde_json::to_value(NodePayload { family_id, node: &node })?;
        self.engine
            .queue(NewOperation::update(NODES_TABLE, node.id, payload).with_priority(Priority::Medium))
            .await?;

        info!(family_id, node_id = %node.id, "Node updated");
        Ok(node)
    }

    /// Remove a node and every local edge touching it. Only the node delete is
    /// queued unless the policy asks for the cascaded edge deletes too.
    pub async fn delete_node(&self, family_id: &str, node_id: Uuid) -> Result<FamilyNode> {
        let _guard = self.lock_family(family_id).await;
        let graph = self.cache.get(family_id).await?;

        let node = graph.node(node_id).cloned().ok_or(SyncError::NotFound("node"))?;
        let (next, removed_edges) = graph.without_node(node_id);
        self.cache.put(family_id, next).await?;

        let payload = serde_json::to_value(NodeDeletePayload { family_id, node_id })?;
        self.engine
            .queue(NewOperation::delete(NODES_TABLE, node_id, payload).with_priority(Priority::Medium))
            .await?;

        if self.policy.queue_cascaded_edge_deletes {
            for edge in &removed_edges {
                self.queue_edge_delete(family_id, edge.id).await?;
            }
        }

        info!(family_id, node_id = %node_id, cascaded_edges = removed_edges.len(), "Node deleted");
        Ok(node)
    }

    /// Append an edge. Endpoints are only checked when the policy says so.
    pub async fn add_edge(&self, family_id: &str, input: EdgeInput) -> Result<FamilyEdge> {
        let _guard = self.lock_family(family_id).await;
        let graph = self.cache.get(family_id).await?;

        if self.policy.validate_edge_endpoints {
            for endpoint in [input.source, input.target] {
                if !graph.contains_node(endpoint) {
                    return Err(SyncError::InvalidEdge(format!("node {} is not in the graph", endpoint)));
                }
            }
        }

        let edge = input.into_edge();
        self.cache.put(family_id, graph.with_edge(edge.clone())).await?;

        let payload = serde_json::to_value(EdgePayload { family_id, edge: &edge })?;
        self.engine
            .queue(NewOperation::insert(EDGES_TABLE, payload).with_record_id(edge.id).with_priority(Priority::Medium))
            .await?;

        info!(family_id, edge_id = %edge.id, kind = ?edge.kind, "Edge added");
        Ok(edge)
    }

    pub async fn delete_edge(&self, family_id: &str, edge_id: Uuid) -> Result<FamilyEdge> {
        let _guard = self.lock_family(family_id).await;
        let graph = self.cache.get(family_id).await?;

        let edge = graph.edge(edge_id).cloned().ok_or(SyncError::NotFound("edge"))?;
        self.cache.put(family_id, graph.without_edge(edge_id)).await?;
        self.queue_edge_delete(family_id, edge_id).await?;

        info!(family_id, edge_id = %edge_id, "Edge deleted");
        Ok(edge)
    }

    async fn queue_edge_delete(&self, family_id: &str, edge_id: Uuid) -> Result<()> {
        let payload = serde_json::to_value(EdgeDeletePayload { family_id, edge_id })?;
        self.engine
            .queue(NewOperation::delete(EDGES_TABLE, edge_id, payload).with_priority(Priority::Medium))
            .await?;
        debug!(family_id, edge_id = %edge_id, "Edge delete queued");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
