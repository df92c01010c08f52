use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// A reachability signal for the remote authority.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Current online/offline state, shared by the cache and the sync engine.
/// Clone is cheap; all clones observe the same state.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { state: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current state. Returns true only on an actual transition.
    pub fn set_online(&self, online: bool) -> bool {
        self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Poll `monitor` every `interval` and record the result. Only the flag
    /// changes; use `SyncEngine::watch_connectivity` to also drive syncing.
    pub fn spawn_probe(&self, monitor: Arc<dyn NetworkMonitor>, interval: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let online = monitor.is_reachable().await;
                if state.set_online(online) {
                    info!(online, "Connectivity changed");
                }
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
