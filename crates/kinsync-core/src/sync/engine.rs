//! The sync engine drains queued operations against the remote store.
//!
//! Drains are single-flight: a drain requested while another runs returns
//! immediately. Within a drain, operations run sequentially in priority band
//! order (High, Medium, Low) and FIFO within a band. Each pending operation is
//! attempted at most once per drain; a failure either sends it back to
//! `Pending` for a later drain or, once the attempt budget is spent, marks it
//! `Failed`, where it stays until `retry_failed` or `discard_failed`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ConnectivityMonitor, NetworkMonitor, OperationQueue};
use crate::api::RemoteStore;
use crate::error::{Result, SyncError};
use crate::models::{NewOperation, OperationKind, OperationStatus, SyncOperation, SyncStatus};
use crate::store::KeyValueStore;

// ============================================================================
// Constants
// ============================================================================

/// Attempts before an operation is marked `Failed`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Policy
// ============================================================================

/// Delay schedule for automatic re-drains after failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Upper bound of the uniform random delay added on top.
    pub jitter: Duration,
}

impl Backoff {
    /// `initial * 2^(attempt-1)`, capped at `max`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn delay_for<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 { 0 } else { rng.gen_range(0..=jitter_ms) };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// When set, a drain that sends operations back to `Pending` schedules
    /// another drain after the backoff delay. When unset, requeued operations
    /// wait for the next enqueue or reconnect.
    pub backoff: Option<Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Start a drain automatically on enqueue and on reconnect.
    pub auto_drain: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            auto_drain: true,
        }
    }
}

/// Outcome of one `drain` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub completed: usize,
    /// Failed attempts sent back to `Pending`.
    pub requeued: usize,
    /// Failed attempts that exhausted the budget.
    pub failed: usize,
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Subscribers
// ============================================================================

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

/// Removes a subscriber when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
}

/// Resets the single-flight flag when a drain ends, including on early return,
/// and wakes anyone waiting for the engine to go idle.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
    idle: &'a Notify,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool, idle: &'a Notify) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, idle })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    queue: AsyncMutex<OperationQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    syncing: AtomicBool,
    idle: Notify,
    /// Drains started in the background by `queue` or the connectivity watcher.
    background: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Listeners>,
    config: EngineConfig,
}

/// Sync engine handle.
/// Clone is cheap - all clones share one queue, one drain flag and one subscriber set.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open the engine over `store`, restoring any operations persisted by a
    /// previous run.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        config: EngineConfig,
    ) -> Result<Self> {
        let queue = OperationQueue::load(store).await?;
        info!(
            queued = queue.len(),
            online = connectivity.is_online(),
            "Sync engine opened"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                queue: AsyncMutex::new(queue),
                remote,
                connectivity,
                syncing: AtomicBool::new(false),
                idle: Notify::new(),
                background: Mutex::new(Vec::new()),
                listeners: Mutex::new(Listeners::default()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    // =========================================================================
    // Queueing
    // =========================================================================

    /// Durably enqueue an operation. When this returns `Ok`, the operation
    /// survives a restart even if it has not reached the remote yet.
    pub async fn queue(&self, op: NewOperation) -> Result<SyncOperation> {
        let (queued, status) = {
            let mut queue = self.inner.queue.lock().await;
            let queued = queue.push(op).await?;
            (queued, self.status_of(&queue))
        };
        debug!(
            operation = %queued.id,
            table = %queued.table,
            kind = ?queued.kind,
            priority = ?queued.priority,
            "Operation queued"
        );
        self.publish(&status);

        if self.inner.config.auto_drain && self.is_online() && !self.is_syncing() {
            self.spawn_drain();
        }
        Ok(queued)
    }

    fn spawn_drain(&self) {
        let drain = self.clone().drain_owned();
        let handle = tokio::spawn(async move {
            if let Err(e) = drain.await {
                error!(error = %e, "Background drain failed");
            }
        });
        let mut background = lock_or_recover(&self.inner.background);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Wait until no drain is running and every background drain has ended.
    ///
    /// A drain cut off mid-call leaves its operation `Processing`, which is
    /// replayed on the next start, so call this before the runtime shuts down.
    /// Scheduled backoff retries are not waited for.
    pub async fn wait_idle(&self) {
        loop {
            let handles = std::mem::take(&mut *lock_or_recover(&self.inner.background));
            if !handles.is_empty() {
                for result in futures::future::join_all(handles).await {
                    if let Err(e) = result {
                        warn!(error = %e, "Background drain did not finish cleanly");
                    }
                }
                continue;
            }

            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Register before checking the flag so a release in between is not missed
            idle.as_mut().enable();
            if !self.is_syncing() {
                return;
            }
            idle.await;
        }
    }

    /// Boxed drain for spawning from inside the engine; a named future type
    /// keeps `drain` from containing itself.
    fn drain_owned(self) -> BoxFuture<'static, Result<DrainReport>> {
        Box::pin(async move { self.drain().await })
    }

    // =========================================================================
    // Draining
    // =========================================================================

    /// Push pending operations to the remote. See the module docs for ordering
    /// and retry rules. Only persistence failures are returned as errors;
    /// remote failures are recorded on the operations themselves.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut attempted = HashSet::new();

        loop {
            let Some(guard) = DrainGuard::acquire(&self.inner.syncing, &self.inner.idle) else {
                if attempted.is_empty() {
                    debug!("Drain already in progress");
                    return Ok(DrainReport::skipped());
                }
                break;
            };
            let before = attempted.len();
            self.run_passes(&mut attempted, &mut report).await?;
            drop(guard);

            if attempted.len() > before {
                let status = self.get_status().await;
                self.publish(&status);
            }

            // An enqueue that saw the flag still set did not start its own drain
            if !self.is_online() || !self.has_unattempted(&attempted).await {
                break;
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                completed = report.completed,
                requeued = report.requeued,
                failed = report.failed,
                "Drain finished"
            );
            self.schedule_retry(&report).await;
        }
        Ok(report)
    }

    async fn run_passes(&self, attempted: &mut HashSet<Uuid>, report: &mut DrainReport) -> Result<()> {
        loop {
            let batch: Vec<Uuid> = {
                let queue = self.inner.queue.lock().await;
                queue
                    .pending_in_drain_order()
                    .into_iter()
                    .filter(|id| !attempted.contains(id))
                    .collect()
            };
            if batch.is_empty() {
                break;
            }

            for id in batch {
                if !self.is_online() {
                    info!("Connectivity lost, stopping drain");
                    break;
                }
                attempted.insert(id);
                self.process(id, report).await?;
            }
            if !self.is_online() {
                break;
            }
        }

        let pruned = self.inner.queue.lock().await.prune_completed().await?;
        if pruned > 0 {
            debug!(pruned, "Pruned completed operations");
        }
        Ok(())
    }

    async fn process(&self, id: Uuid, report: &mut DrainReport) -> Result<()> {
        let (op, status) = {
            let mut queue = self.inner.queue.lock().await;
            // Skip anything discarded or already handled since the batch was selected
            if !queue.get(id).is_some_and(|op| op.is_pending()) {
                return Ok(());
            }
            let op = queue.modify(id, |op| op.status = OperationStatus::Processing).await?;
            (op, self.status_of(&queue))
        };
        let Some(op) = op else { return Ok(()) };
        self.publish(&status);
        report.attempted += 1;

        let outcome = self.execute(&op).await;

        let status = {
            let mut queue = self.inner.queue.lock().await;
            match outcome {
                Ok(()) => {
                    queue.modify(id, |op| op.status = OperationStatus::Completed).await?;
                    report.completed += 1;
                    debug!(operation = %id, table = %op.table, "Operation synced");
                }
                Err(e) => {
                    let max_attempts = self.inner.config.retry.max_attempts;
                    let updated = queue.record_failure(id, e.to_string(), max_attempts).await?;
                    match updated.map(|op| (op.status, op.retry_count)) {
                        Some((OperationStatus::Failed, attempts)) => {
                            report.failed += 1;
                            error!(operation = %id, table = %op.table, attempts, error = %e, "Operation failed permanently");
                        }
                        Some((_, attempts)) => {
                            report.requeued += 1;
                            warn!(
                                operation = %id,
                                table = %op.table,
                                attempts,
                                transient = e.is_transient(),
                                error = %e,
                                "Operation failed, will retry"
                            );
                        }
                        None => {}
                    }
                }
            }
            self.status_of(&queue)
        };
        self.publish(&status);
        Ok(())
    }

    async fn execute(&self, op: &SyncOperation) -> Result<()> {
        let remote = &self.inner.remote;
        match op.kind {
            OperationKind::Insert => {
                remote.insert(&op.table, &op.payload).await?;
            }
            OperationKind::Update => {
                let id = op.target_id().ok_or(SyncError::NotFound("record id"))?;
                remote.update(&op.table, &id, &op.payload).await?;
            }
            OperationKind::Delete => {
                let id = op.target_id().ok_or(SyncError::NotFound("record id"))?;
                remote.delete(&op.table, &id).await?;
            }
        }
        Ok(())
    }

    async fn has_unattempted(&self, attempted: &HashSet<Uuid>) -> bool {
        let queue = self.inner.queue.lock().await;
        queue
            .pending_in_drain_order()
            .iter()
            .any(|id| !attempted.contains(id))
    }

    /// With a backoff policy, re-drain later if this drain left retryable work.
    async fn schedule_retry(&self, report: &DrainReport) {
        let Some(backoff) = self.inner.config.retry.backoff else { return };
        if report.requeued == 0 || !self.is_online() {
            return;
        }
        let attempt = {
            let queue = self.inner.queue.lock().await;
            queue
                .operations()
                .iter()
                .filter(|op| op.is_pending())
                .map(|op| op.retry_count)
                .max()
                .unwrap_or(1)
        };
        let delay = backoff.delay_for(attempt, &mut rand::thread_rng());
        info!(delay_ms = delay.as_millis() as u64, attempt, "Scheduling retry drain");

        let engine = self.clone();
        let drain = self.clone().drain_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if engine.is_online() {
                if let Err(e) = drain.await {
                    error!(error = %e, "Retry drain failed");
                }
            }
        });
    }

    // =========================================================================
    // Failed operations
    // =========================================================================

    pub async fn failed_operations(&self) -> Vec<SyncOperation> {
        self.inner.queue.lock().await.failed()
    }

    pub async fn operations(&self) -> Vec<SyncOperation> {
        self.inner.queue.lock().await.operations().to_vec()
    }

    /// Give every failed operation a fresh attempt budget and drain if online.
    pub async fn retry_failed(&self) -> Result<usize> {
        let (count, status) = {
            let mut queue = self.inner.queue.lock().await;
            let count = queue.reset_failed().await?;
            (count, self.status_of(&queue))
        };
        if count == 0 {
            return Ok(0);
        }
        info!(count, "Failed operations requeued");
        self.publish(&status);
        if self.is_online() {
            self.drain().await?;
        }
        Ok(count)
    }

    /// Drop failed operations for good.
    pub async fn discard_failed(&self) -> Result<usize> {
        let (count, status) = {
            let mut queue = self.inner.queue.lock().await;
            let count = queue.remove_failed().await?;
            (count, self.status_of(&queue))
        };
        if count > 0 {
            warn!(count, "Discarded failed operations");
            self.publish(&status);
        }
        Ok(count)
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    /// Record connectivity. A transition notifies subscribers; regaining
    /// connectivity drains immediately when auto-drain is on.
    pub async fn set_online(&self, online: bool) -> Result<()> {
        if self.record_connectivity(online).await && online && self.inner.config.auto_drain {
            self.drain().await?;
        }
        Ok(())
    }

    /// Apply a connectivity reading; true on a transition.
    async fn record_connectivity(&self, online: bool) -> bool {
        if !self.inner.connectivity.set_online(online) {
            return false;
        }
        if online {
            info!("Connectivity restored");
        } else {
            warn!("Connectivity lost, queueing locally");
        }
        let status = self.get_status().await;
        self.publish(&status);
        true
    }

    /// Poll `monitor` every `interval` and apply each reading like `set_online`.
    /// Drains triggered by a reconnect run as background drains, so aborting
    /// the returned handle never interrupts one; `wait_idle` covers them.
    pub fn watch_connectivity(&self, monitor: Arc<dyn NetworkMonitor>, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reachable = monitor.is_reachable().await;
                if engine.record_connectivity(reachable).await && reachable && engine.inner.config.auto_drain {
                    engine.spawn_drain();
                }
            }
        })
    }

    // =========================================================================
    // Status & subscribers
    // =========================================================================

    pub async fn get_status(&self) -> SyncStatus {
        let queue = self.inner.queue.lock().await;
        self.status_of(&queue)
    }

    fn status_of(&self, queue: &OperationQueue) -> SyncStatus {
        SyncStatus {
            is_online: self.is_online(),
            pending_operations: queue.outstanding_count(),
            failed_operations: queue.failed_count(),
            is_syncing: self.is_syncing(),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        lock_or_recover(&self.inner.listeners)
    }

    /// Register `listener`, replay the current status to it, and return a
    /// closure that unregisters it.
    pub async fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = {
            let mut listeners = self.listeners();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.insert(id, Arc::clone(&listener));
            id
        };

        let status = self.get_status().await;
        listener(&status);

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock_or_recover(&inner.listeners).entries.remove(&id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners().entries.len()
    }

    fn publish(&self, status: &SyncStatus) {
        // Snapshot first so listeners may subscribe/unsubscribe while being called
        let listeners: Vec<Listener> = self.listeners().entries.values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::models::{FamilyGraph, Priority};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    /// Remote that records every call as `verb:table:label` and can be told to fail.
    #[derive(Default)]
    struct RecordingRemote {
        calls: Mutex<Vec<String>>,
        fail: AtomicBool,
        delay: Option<Duration>,
    }

    impl RecordingRemote {
        fn failing() -> Self {
            Self {
                fail: AtomicBool::new(true),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn record(&self, entry: String) -> std::result::Result<(), ApiError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push(entry);
            if self.fail.load(Ordering::SeqCst) {
                Err(ApiError::ServerError("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn label(data: &Value) -> String {
        data.get("label").and_then(Value::as_str).unwrap_or("-").to_string()
    }

    #[async_trait]
    impl RemoteStore for RecordingRemote {
        async fn insert(&self, table: &str, data: &Value) -> std::result::Result<Value, ApiError> {
            self.record(format!("insert:{}:{}", table, label(data))).await?;
            Ok(Value::Null)
        }

        async fn update(&self, table: &str, id: &str, _data: &Value) -> std::result::Result<Value, ApiError> {
            self.record(format!("update:{}:{}", table, id)).await?;
            Ok(Value::Null)
        }

        async fn delete(&self, table: &str, id: &str) -> std::result::Result<(), ApiError> {
            self.record(format!("delete:{}:{}", table, id)).await
        }

        async fn fetch_graph(&self, _family_id: &str) -> std::result::Result<Option<FamilyGraph>, ApiError> {
            Ok(None)
        }
    }

    fn manual() -> EngineConfig {
        EngineConfig {
            auto_drain: false,
            ..EngineConfig::default()
        }
    }

    async fn engine_with(
        remote: Arc<RecordingRemote>,
        online: bool,
        config: EngineConfig,
    ) -> (SyncEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::open(store.clone(), remote, ConnectivityMonitor::new(online), config)
            .await
            .unwrap();
        (engine, store)
    }

    fn op(label: &str, priority: Priority) -> NewOperation {
        NewOperation::insert("family_graph_nodes", json!({"label": label})).with_priority(priority)
    }

    fn collect_statuses() -> (Arc<Mutex<Vec<SyncStatus>>>, impl Fn(&SyncStatus) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |status: &SyncStatus| sink.lock().unwrap().push(*status))
    }

    #[tokio::test]
    async fn test_drain_empty_is_noop() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, store) = engine_with(remote.clone(), true, manual()).await;
        let (seen, listener) = collect_statuses();
        let _unsubscribe = engine.subscribe(listener).await;
        let writes = store.writes();

        let report = engine.drain().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(remote.calls().is_empty());
        assert_eq!(store.writes(), writes);
        // Only the replay on subscribe
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_priority_bands_then_fifo() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _store) = engine_with(remote.clone(), true, manual()).await;

        engine.queue(op("low", Priority::Low)).await.unwrap();
        engine.queue(op("high-1", Priority::High)).await.unwrap();
        engine.queue(op("medium", Priority::Medium)).await.unwrap();
        engine.queue(op("high-2", Priority::High)).await.unwrap();

        let report = engine.drain().await.unwrap();
        assert_eq!(report.completed, 4);
        assert_eq!(
            remote.calls(),
            vec![
                "insert:family_graph_nodes:high-1",
                "insert:family_graph_nodes:high-2",
                "insert:family_graph_nodes:medium",
                "insert:family_graph_nodes:low",
            ]
        );
    }

    #[tokio::test]
    async fn test_scenario_drain_empties_queue_and_notifies() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, store) = engine_with(remote.clone(), true, manual()).await;

        engine.queue(op("a", Priority::High)).await.unwrap();
        engine.queue(op("b", Priority::Medium)).await.unwrap();
        engine.queue(op("c", Priority::Low)).await.unwrap();

        let (seen, listener) = collect_statuses();
        let _unsubscribe = engine.subscribe(listener).await;
        assert_eq!(seen.lock().unwrap()[0].pending_operations, 3);

        engine.drain().await.unwrap();

        assert!(engine.operations().await.is_empty());
        assert!(store.is_empty().await);
        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last.pending_operations, 0);
        assert!(!last.is_syncing);
        assert!(last.is_online);
    }

    #[tokio::test]
    async fn test_retry_bound_then_failed() {
        let remote = Arc::new(RecordingRemote::failing());
        let (engine, _store) = engine_with(remote.clone(), true, manual()).await;
        let queued = engine.queue(op("doomed", Priority::Medium)).await.unwrap();

        for attempt in 1..=2 {
            let report = engine.drain().await.unwrap();
            assert_eq!(report.attempted, 1);
            assert_eq!(report.requeued, 1);
            let ops = engine.operations().await;
            assert_eq!(ops[0].status, OperationStatus::Pending);
            assert_eq!(ops[0].retry_count, attempt);
        }

        let report = engine.drain().await.unwrap();
        assert_eq!(report.failed, 1);

        let failed = engine.failed_operations().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, queued.id);
        assert_eq!(failed[0].retry_count, 3);
        assert!(failed[0].error.as_deref().unwrap().contains("boom"));

        // Terminal: not pruned, not re-attempted
        let report = engine.drain().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(remote.calls().len(), 3);
        let status = engine.get_status().await;
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.failed_operations, 1);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_batch() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _store) = engine_with(remote.clone(), true, manual()).await;

        // Update without a record id cannot be dispatched
        engine
            .queue(NewOperation::new("family_graph_nodes", OperationKind::Update, json!({})).with_priority(Priority::High))
            .await
            .unwrap();
        engine.queue(op("fine", Priority::Low)).await.unwrap();

        let report = engine.drain().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(remote.calls(), vec!["insert:family_graph_nodes:fine"]);

        let ops = engine.operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].error.as_deref(), Some("record id not found"));
    }

    #[tokio::test]
    async fn test_update_and_delete_use_record_id() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _store) = engine_with(remote.clone(), true, manual()).await;

        engine.queue(NewOperation::update("people", "p1", json!({"name": "x"}))).await.unwrap();
        engine.queue(NewOperation::delete("people", "p2", json!({}))).await.unwrap();
        engine.drain().await.unwrap();

        assert_eq!(remote.calls(), vec!["update:people:p1", "delete:people:p2"]);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, store) = engine_with(remote.clone(), false, EngineConfig::default()).await;
        let queued = engine
            .queue(NewOperation::insert("family_graph_edges", json!({"familyId": "f1", "edge": {"id": "e1"}})))
            .await
            .unwrap();
        drop(engine);

        let reopened = SyncEngine::open(store, remote, ConnectivityMonitor::new(false), EngineConfig::default())
            .await
            .unwrap();
        let ops = reopened.operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].table, queued.table);
        assert_eq!(ops[0].kind, queued.kind);
        assert_eq!(ops[0].payload, queued.payload);
    }

    #[tokio::test]
    async fn test_offline_queue_then_reconnect_drains() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _store) = engine_with(remote.clone(), false, EngineConfig::default()).await;
        let (seen, listener) = collect_statuses();
        let _unsubscribe = engine.subscribe(listener).await;

        engine.queue(op("offline", Priority::Medium)).await.unwrap();
        assert!(remote.calls().is_empty());
        assert_eq!(engine.get_status().await.pending_operations, 1);

        // Explicit drain while offline leaves the operation untouched
        let report = engine.drain().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(engine.operations().await[0].retry_count, 0);

        engine.set_online(true).await.unwrap();
        assert_eq!(remote.calls(), vec!["insert:family_graph_nodes:offline"]);
        assert!(engine.operations().await.is_empty());

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|s| s.is_online && s.pending_operations == 1));
        assert_eq!(seen.last().unwrap().pending_operations, 0);
    }

    #[tokio::test]
    async fn test_connectivity_transition_notifies_once() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _store) = engine_with(remote, true, manual()).await;
        let (seen, listener) = collect_statuses();
        let _unsubscribe = engine.subscribe(listener).await;

        engine.set_online(false).await.unwrap();
        engine.set_online(false).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[1].is_online);
    }

    #[tokio::test]
    async fn test_auto_drain_on_queue() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _store) = engine_with(remote.clone(), true, EngineConfig::default()).await;

        engine.queue(op("auto", Priority::High)).await.unwrap();

        for _ in 0..100 {
            if engine.get_status().await.pending_operations == 0 && !engine.is_syncing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remote.calls(), vec!["insert:family_graph_nodes:auto"]);
        assert!(engine.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_outlasts_background_drain() {
        let remote = Arc::new(RecordingRemote::slow(Duration::from_millis(100)));
        let (engine, store) = engine_with(remote.clone(), true, EngineConfig::default()).await;

        engine.queue(op("slow", Priority::Medium)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.is_syncing());

        engine.wait_idle().await;
        assert!(!engine.is_syncing());
        assert_eq!(remote.calls().len(), 1);
        // Completed and pruned, so nothing is left to replay after a restart
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_enqueue_racing_an_idle_drain_is_not_stranded() {
        let remote = Arc::new(RecordingRemote::default());
        for round in 0..50 {
            let (engine, _store) = engine_with(remote.clone(), true, EngineConfig::default()).await;

            let drainer = tokio::spawn({
                let engine = engine.clone();
                async move { engine.drain().await }
            });
            let queuer = tokio::spawn({
                let engine = engine.clone();
                async move { engine.queue(op("race", Priority::Medium)).await }
            });
            queuer.await.unwrap().unwrap();
            drainer.await.unwrap().unwrap();
            engine.wait_idle().await;

            assert_eq!(engine.get_status().await.pending_operations, 0, "round {}", round);
        }
        assert_eq!(remote.calls().len(), 50);
    }

    #[tokio::test]
    async fn test_drain_is_single_flight() {
        let remote = Arc::new(RecordingRemote::slow(Duration::from_millis(50)));
        let (engine, _store) = engine_with(remote.clone(), true, manual()).await;
        engine.queue(op("slow", Priority::Medium)).await.unwrap();

        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.drain().await
        };
        let (first, second) = tokio::join!(engine.drain(), second);

        assert_eq!(first.unwrap().completed, 1);
        assert!(second.unwrap().skipped);
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_operations_enqueued_during_drain_are_picked_up() {
        let remote = Arc::new(RecordingRemote::slow(Duration::from_millis(30)));
        let (engine, _store) = engine_with(remote.clone(), true, manual()).await;
        engine.queue(op("first", Priority::Low)).await.unwrap();

        let late = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.queue(op("late", Priority::High)).await.unwrap();
        };
        let (report, _) = tokio::join!(engine.drain(), late);

        assert_eq!(report.unwrap().completed, 2);
        assert_eq!(
            remote.calls(),
            vec!["insert:family_graph_nodes:first", "insert:family_graph_nodes:late"]
        );
    }

    #[tokio::test]
    async fn test_retry_failed_and_discard() {
        let remote = Arc::new(RecordingRemote::failing());
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                backoff: None,
            },
            auto_drain: false,
        };
        let (engine, _store) = engine_with(remote.clone(), true, config).await;
        engine.queue(op("x", Priority::Medium)).await.unwrap();
        engine.drain().await.unwrap();
        assert_eq!(engine.failed_operations().await.len(), 1);

        remote.fail.store(false, Ordering::SeqCst);
        assert_eq!(engine.retry_failed().await.unwrap(), 1);
        assert!(engine.operations().await.is_empty());
        assert_eq!(remote.calls().len(), 2);

        remote.fail.store(true, Ordering::SeqCst);
        engine.queue(op("y", Priority::Medium)).await.unwrap();
        engine.drain().await.unwrap();
        assert_eq!(engine.discard_failed().await.unwrap(), 1);
        assert!(engine.operations().await.is_empty());
        assert_eq!(engine.retry_failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let remote = Arc::new(RecordingRemote::default());
        let (engine, _store) = engine_with(remote, false, manual()).await;
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let unsubscribe = engine
            .subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(engine.subscriber_count(), 1);

        engine.queue(op("a", Priority::Low)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        unsubscribe();
        assert_eq!(engine.subscriber_count(), 0);
        engine.queue(op("b", Priority::Low)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: Duration::from_millis(50),
        };
        assert_eq!(backoff.base_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(400));
        assert_eq!(backoff.base_delay(10), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(1));

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let delay = backoff.delay_for(2, &mut rng);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_backoff_schedules_follow_up_drain() {
        let remote = Arc::new(RecordingRemote::failing());
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                backoff: Some(Backoff {
                    initial: Duration::from_millis(10),
                    max: Duration::from_millis(10),
                    jitter: Duration::ZERO,
                }),
            },
            auto_drain: false,
        };
        let (engine, _store) = engine_with(remote.clone(), true, config).await;
        engine.queue(op("flaky", Priority::Medium)).await.unwrap();
        engine.drain().await.unwrap();

        for _ in 0..100 {
            if engine.get_status().await.failed_operations == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remote.calls().len(), 2);
        assert_eq!(engine.failed_operations().await.len(), 1);
    }
}
