use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::RemoteStore;
use crate::error::{Result, SyncError};
use crate::models::FamilyGraph;
use crate::store::{self, KeyValueStore};
use crate::sync::ConnectivityMonitor;

/// Key prefix for persisted graph snapshots.
pub const GRAPH_KEY_PREFIX: &str = "graph.";

/// Maximum concurrent store reads during preload.
const PRELOAD_CONCURRENCY: usize = 8;

fn graph_key(family_id: &str) -> String {
    format!("{}{}", GRAPH_KEY_PREFIX, family_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// In-memory tier. Tracks access order (oldest first) for LRU eviction when
/// a capacity is set.
#[derive(Default)]
struct MemoryTier {
    graphs: HashMap<String, FamilyGraph>,
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl MemoryTier {
    fn touch(&mut self, family_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == family_id) {
            self.order.remove(pos);
        }
        self.order.push_back(family_id.to_string());
    }

    fn get(&mut self, family_id: &str) -> Option<FamilyGraph> {
        let graph = self.graphs.get(family_id).cloned()?;
        self.touch(family_id);
        Some(graph)
    }

    fn insert(&mut self, family_id: &str, graph: FamilyGraph) {
        self.graphs.insert(family_id.to_string(), graph);
        self.touch(family_id);

        let Some(capacity) = self.capacity else { return };
        while self.graphs.len() > capacity.max(1) {
            let Some(oldest) = self.order.pop_front() else { break };
            self.graphs.remove(&oldest);
            debug!(family_id = %oldest, "Evicted graph from memory");
        }
    }

    fn remove(&mut self, family_id: &str) -> bool {
        self.order.retain(|id| id != family_id);
        self.graphs.remove(family_id).is_some()
    }

    fn clear(&mut self) {
        self.graphs.clear();
        self.order.clear();
    }
}

struct CacheInner {
    memory: Mutex<MemoryTier>,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
}

/// Two-tier family graph cache.
/// Clone is cheap - clones share both tiers.
#[derive(Clone)]
pub struct GraphCache {
    inner: Arc<CacheInner>,
}

impl GraphCache {
    /// `capacity` bounds the memory tier; `None` keeps every graph in memory.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        capacity: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                memory: Mutex::new(MemoryTier {
                    capacity,
                    ..MemoryTier::default()
                }),
                store,
                remote,
                connectivity,
            }),
        }
    }

    /// Current snapshot for `family_id`: memory, then store, then remote.
    pub async fn get(&self, family_id: &str) -> Result<FamilyGraph> {
        if let Some(graph) = self.inner.memory.lock().await.get(family_id) {
            return Ok(graph);
        }

        let stored: Option<CachedData<FamilyGraph>> =
            store::load(self.inner.store.as_ref(), &graph_key(family_id)).await?;
        if let Some(cached) = stored {
            debug!(family_id, age = %cached.age_display(), "Graph hydrated from store");
            self.inner.memory.lock().await.insert(family_id, cached.data.clone());
            return Ok(cached.data);
        }

        if !self.inner.connectivity.is_online() {
            debug!(family_id, "Graph not cached and offline");
            return Err(SyncError::NotFound("family graph"));
        }

        match self.inner.remote.fetch_graph(family_id).await? {
            Some(graph) => {
                info!(family_id, nodes = graph.nodes.len(), edges = graph.edges.len(), "Graph fetched from remote");
                self.put(family_id, graph.clone()).await?;
                Ok(graph)
            }
            None => Err(SyncError::NotFound("family graph")),
        }
    }

    /// Write `graph` to the store and then to memory. On `Ok` the snapshot is
    /// durable; on error neither tier changes.
    pub async fn put(&self, family_id: &str, graph: FamilyGraph) -> Result<()> {
        let cached = CachedData::new(graph);
        store::save(self.inner.store.as_ref(), &graph_key(family_id), &cached).await?;
        self.inner.memory.lock().await.insert(family_id, cached.data);
        Ok(())
    }

    /// Hydrate memory with every persisted graph. Unreadable entries are
    /// skipped. Returns how many graphs were loaded.
    pub async fn preload(&self) -> Result<usize> {
        let family_ids = store::keys_with_prefix(self.inner.store.as_ref(), GRAPH_KEY_PREFIX).await?;
        let store = Arc::clone(&self.inner.store);

        let loaded: Vec<(String, FamilyGraph)> = stream::iter(family_ids)
            .map(|family_id| {
                let store = Arc::clone(&store);
                async move {
                    let result = store::load::<CachedData<FamilyGraph>>(store.as_ref(), &graph_key(&family_id)).await;
                    (family_id, result)
                }
            })
            .buffer_unordered(PRELOAD_CONCURRENCY)
            .filter_map(|(family_id, result)| async move {
                match result {
                    Ok(Some(cached)) => Some((family_id, cached.data)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(family_id = %family_id, error = %e, "Skipping unreadable cached graph");
                        None
                    }
                }
            })
            .collect()
            .await;

        let count = loaded.len();
        let mut memory = self.inner.memory.lock().await;
        for (family_id, graph) in loaded {
            memory.insert(&family_id, graph);
        }
        info!(count, "Graph cache preloaded");
        Ok(count)
    }

    /// Wipe both tiers. Only graph snapshots are removed from the store.
    pub async fn clear(&self) -> Result<()> {
        self.inner.memory.lock().await.clear();
        for family_id in store::keys_with_prefix(self.inner.store.as_ref(), GRAPH_KEY_PREFIX).await? {
            self.inner.store.delete(&graph_key(&family_id)).await?;
        }
        info!("Graph cache cleared");
        Ok(())
    }

    /// Drop the memory copy only; the next `get` rehydrates from the store.
    pub async fn evict(&self, family_id: &str) -> bool {
        self.inner.memory.lock().await.remove(family_id)
    }

    /// When the persisted snapshot for `family_id` was written.
    pub async fn cached_at(&self, family_id: &str) -> Result<Option<DateTime<Utc>>> {
        let stored: Option<CachedData<FamilyGraph>> =
            store::load(self.inner.store.as_ref(), &graph_key(family_id)).await?;
        Ok(stored.map(|c| c.cached_at))
    }

    /// Family ids currently held in memory.
    pub async fn memory_family_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.memory.lock().await.graphs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// Tests
// ============================================================================
