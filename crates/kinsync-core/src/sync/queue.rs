//! Durable operation queue.
//!
//! Each operation is persisted under its own `op.<id>` key, so enqueueing or
//! pruning writes one entry instead of re-serializing the whole queue.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{NewOperation, OperationStatus, SyncOperation};
use crate::store::{self, KeyValueStore};

/// Key prefix for persisted operations.
pub const OPERATION_KEY_PREFIX: &str = "op.";

fn operation_key(id: Uuid) -> String {
    format!("{}{}", OPERATION_KEY_PREFIX, id)
}

pub struct OperationQueue {
    store: Arc<dyn KeyValueStore>,
    operations: Vec<SyncOperation>,
    next_seq: u64,
}

impl OperationQueue {
    /// Restore the queue from the store.
    ///
    /// Operations found `Processing` were in flight when the process stopped;
    /// whether the remote applied them is unknown, so they go back to `Pending`.
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let mut operations = Vec::new();
        for id in store::keys_with_prefix(store.as_ref(), OPERATION_KEY_PREFIX).await? {
            let key = format!("{}{}", OPERATION_KEY_PREFIX, id);
            match store::load::<SyncOperation>(store.as_ref(), &key).await {
                Ok(Some(op)) => operations.push(op),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable queued operation"),
            }
        }
        operations.sort_by_key(|op| (op.enqueued_at, op.seq));

        let next_seq = operations.iter().map(|op| op.seq + 1).max().unwrap_or(0);
        let mut queue = Self {
            store,
            operations,
            next_seq,
        };

        let interrupted: Vec<Uuid> = queue
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Processing)
            .map(|op| op.id)
            .collect();
        for id in interrupted {
            warn!(operation = %id, "Resetting operation interrupted mid-flight");
            queue.modify(id, |op| op.status = OperationStatus::Pending).await?;
        }

        debug!(count = queue.operations.len(), "Operation queue loaded");
        Ok(queue)
    }

    /// Assign bookkeeping and persist. The operation is only visible once durable.
    pub async fn push(&mut self, op: NewOperation) -> Result<SyncOperation> {
        let op = SyncOperation::from_new(op, self.next_seq);
        store::save(self.store.as_ref(), &operation_key(op.id), &op).await?;
        self.next_seq += 1;
        self.operations.push(op.clone());
        Ok(op)
    }

    pub fn get(&self, id: Uuid) -> Option<&SyncOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn operations(&self) -> &[SyncOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Ids of pending operations in drain order: priority band, then FIFO.
    pub fn pending_in_drain_order(&self) -> Vec<Uuid> {
        let mut pending: Vec<&SyncOperation> = self.operations.iter().filter(|op| op.is_pending()).collect();
        pending.sort_by_key(|op| op.drain_key());
        pending.into_iter().map(|op| op.id).collect()
    }

    /// Pending plus in-flight operations.
    pub fn outstanding_count(&self) -> usize {
        self.operations.iter().filter(|op| op.is_outstanding()).count()
    }

    pub fn failed(&self) -> Vec<SyncOperation> {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.operations.iter().filter(|op| op.status == OperationStatus::Failed).count()
    }

    /// Apply `change` to one operation and persist it. Returns the updated
    /// operation, or `None` if it is no longer queued.
    pub async fn modify(
        &mut self,
        id: Uuid,
        change: impl FnOnce(&mut SyncOperation),
    ) -> Result<Option<SyncOperation>> {
        let Some(slot) = self.operations.iter_mut().find(|op| op.id == id) else {
            return Ok(None);
        };
        let mut updated = slot.clone();
        change(&mut updated);
        store::save(self.store.as_ref(), &operation_key(id), &updated).await?;
        *slot = updated.clone();
        Ok(Some(updated))
    }

    /// Record a failed attempt. Reaching `max_attempts` makes the failure terminal.
    pub async fn record_failure(
        &mut self,
        id: Uuid,
        error: String,
        max_attempts: u32,
    ) -> Result<Option<SyncOperation>> {
        self.modify(id, |op| {
            op.retry_count += 1;
            op.status = if op.retry_count >= max_attempts {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };
            op.error = Some(error);
        })
        .await
    }

    /// Drop completed operations from memory and the store.
    pub async fn prune_completed(&mut self) -> Result<usize> {
        self.remove_where(|op| op.status == OperationStatus::Completed).await
    }

    /// Put every failed operation back in line with a fresh attempt budget.
    pub async fn reset_failed(&mut self) -> Result<usize> {
        let failed: Vec<Uuid> = self.failed().iter().map(|op| op.id).collect();
        for id in &failed {
            self.modify(*id, |op| {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                op.error = None;
            })
            .await?;
        }
        Ok(failed.len())
    }

    pub async fn remove_failed(&mut self) -> Result<usize> {
        self.remove_where(|op| op.status == OperationStatus::Failed).await
    }

    async fn remove_where(&mut self, predicate: impl Fn(&SyncOperation) -> bool) -> Result<usize> {
        let doomed: Vec<Uuid> = self.operations.iter().filter(|op| predicate(op)).map(|op| op.id).collect();
        for id in &doomed {
            self.store.delete(&operation_key(*id)).await?;
            self.operations.retain(|op| op.id != *id);
        }
        Ok(doomed.len())
    }
}
