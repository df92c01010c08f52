//! Application wiring.
//!
//! `App` owns one instance of each core service, built over an injected store
//! and remote. Open it at startup, call `shutdown` when done.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::RemoteStore;
use crate::cache::GraphCache;
use crate::error::Result;
use crate::ops::{GraphMutations, MutationPolicy};
use crate::store::KeyValueStore;
use crate::sync::{ConnectivityMonitor, EngineConfig, NetworkMonitor, SyncEngine};

/// How long `shutdown` waits for an in-flight drain to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppSettings {
    pub start_online: bool,
    pub memory_capacity: Option<usize>,
    pub engine: EngineConfig,
    pub policy: MutationPolicy,
}

pub struct App {
    pub connectivity: ConnectivityMonitor,
    pub cache: GraphCache,
    pub engine: SyncEngine,
    pub mutations: GraphMutations,
    probe: Option<JoinHandle<()>>,
}

impl App {
    /// Build the services, hydrate the cache and restore the operation queue.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        settings: AppSettings,
    ) -> Result<Self> {
        let connectivity = ConnectivityMonitor::new(settings.start_online);
        let cache = GraphCache::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            connectivity.clone(),
            settings.memory_capacity,
        );
        let graphs = cache.preload().await?;
        let engine = SyncEngine::open(store, remote, connectivity.clone(), settings.engine).await?;
        let mutations = GraphMutations::new(cache.clone(), engine.clone(), settings.policy);

        let status = engine.get_status().await;
        info!(
            graphs,
            pending = status.pending_operations,
            failed = status.failed_operations,
            "App opened"
        );

        Ok(Self {
            connectivity,
            cache,
            engine,
            mutations,
            probe: None,
        })
    }

    /// Start polling `monitor`; connectivity changes drive the engine.
    /// Replaces any probe already running.
    pub fn start_probe(&mut self, monitor: Arc<dyn NetworkMonitor>, interval: Duration) {
        if let Some(previous) = self.probe.take() {
            previous.abort();
        }
        self.probe = Some(self.engine.watch_connectivity(monitor, interval));
    }

    /// Stop background probing and let any running drain record its outcome.
    /// Queued operations are already durable; a drain still running after the
    /// grace period is left to be replayed on the next start.
    pub async fn shutdown(self) {
        self.shutdown_within(SHUTDOWN_GRACE).await
    }

    async fn shutdown_within(mut self, grace: Duration) {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        if tokio::time::timeout(grace, self.engine.wait_idle()).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Drain still running at shutdown");
        }
        let status = self.engine.get_status().await;
        info!(
            pending = status.pending_operations,
            failed = status.failed_operations,
            "App shut down"
        );
    }
}
