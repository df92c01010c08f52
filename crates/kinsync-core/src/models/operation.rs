use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Remote verb an operation maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// Priority band. Declaration order is drain order: High, then Medium, then Low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

/// An operation as handed to `SyncEngine::queue`, before bookkeeping is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub table: String,
    pub kind: OperationKind,
    pub payload: Value,
    pub record_id: Option<String>,
    pub priority: Priority,
}

impl NewOperation {
    pub fn new(table: impl Into<String>, kind: OperationKind, payload: Value) -> Self {
        Self {
            table: table.into(),
            kind,
            payload,
            record_id: None,
            priority: Priority::default(),
        }
    }

    pub fn insert(table: impl Into<String>, payload: Value) -> Self {
        Self::new(table, OperationKind::Insert, payload)
    }

    pub fn update(table: impl Into<String>, record_id: impl ToString, payload: Value) -> Self {
        Self::new(table, OperationKind::Update, payload).with_record_id(record_id)
    }

    pub fn delete(table: impl Into<String>, record_id: impl ToString, payload: Value) -> Self {
        Self::new(table, OperationKind::Delete, payload).with_record_id(record_id)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_record_id(mut self, record_id: impl ToString) -> Self {
        self.record_id = Some(record_id.to_string());
        self
    }
}

/// Durable record of one pending remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: Uuid,
    pub table: String,
    pub kind: OperationKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Enqueue sequence number; breaks timestamp ties so FIFO holds within a band.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOperation {
    pub fn from_new(op: NewOperation, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            table: op.table,
            kind: op.kind,
            payload: op.payload,
            record_id: op.record_id,
            enqueued_at: Utc::now(),
            seq,
            priority: op.priority,
            retry_count: 0,
            status: OperationStatus::Pending,
            error: None,
        }
    }

    /// Row id used for update/delete: the explicit record id, else `payload.id`.
    pub fn target_id(&self) -> Option<String> {
        if let Some(ref id) = self.record_id {
            return Some(id.clone());
        }
        match self.payload.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Drain ordering key: priority band, then enqueue time, then sequence.
    pub fn drain_key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.priority, self.enqueued_at, self.seq)
    }

    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    pub fn is_outstanding(&self) -> bool {
        matches!(self.status, OperationStatus::Pending | OperationStatus::Processing)
    }
}

/// Status snapshot published to subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    /// Pending plus in-flight operations.
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub is_syncing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_from_new_assigns_bookkeeping() {
        let op = SyncOperation::from_new(NewOperation::insert("family_graph_nodes", json!({})), 7);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.seq, 7);
        assert!(op.error.is_none());
    }

    #[test]
    fn test_target_id_fallbacks() {
        let explicit = SyncOperation::from_new(
            NewOperation::delete("family_graph_nodes", "abc", json!({"id": "ignored"})),
            0,
        );
        assert_eq!(explicit.target_id().as_deref(), Some("abc"));

        let from_payload = SyncOperation::from_new(
            NewOperation::new("people", OperationKind::Update, json!({"id": 42})),
            0,
        );
        assert_eq!(from_payload.target_id().as_deref(), Some("42"));

        let missing = SyncOperation::from_new(NewOperation::insert("people", json!({})), 0);
        assert_eq!(missing.target_id(), None);
    }

    #[test]
    fn test_operation_wire_format() {
        let op = SyncOperation::from_new(
            NewOperation::insert("family_graph_nodes", json!({"familyId": "f1"}))
                .with_priority(Priority::High),
            3,
        );
        let value = serde_json::to_value(&op).expect("operation should serialize");
        assert_eq!(value["kind"], "insert");
        assert_eq!(value["priority"], "high");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["retryCount"], 0);
        assert!(value.get("error").is_none());

        let back: SyncOperation = serde_json::from_value(value).expect("operation should parse");
        assert_eq!(back, op);
    }
}
