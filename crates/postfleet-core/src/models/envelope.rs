//! Queue record types: the signed wire envelope, the plain retry envelope,
//! and the bookkeeping wrappers the partitions store.

use crate::models::{Task, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task wrapped with its authenticity layer, exactly as it crosses the
/// producer/worker boundary. Field names and presence are part of the wire
/// contract; both ends must match bit-for-bit or every signature fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTask {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub account_id: String,
    /// Plaintext payload, or the sentinel `{"encrypted": true}` when the
    /// payload travels in `encrypted_payload`.
    pub data: Value,
    /// Hex SHA-256 of the canonical plaintext payload; always present,
    /// even when the payload is encrypted.
    pub data_hash: String,
    pub priority: u8,
    pub created_at: i64,
    pub retry_count: u32,
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
    pub protocol_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
}

/// What actually sits in a queue partition: a signed task fresh from a
/// producer, or a plain task on the retry path (re-enqueued after
/// verification, guarded by field-level validation on redelivery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Signed(SignedTask),
    Plain(Task),
}

impl Envelope {
    pub fn task_id(&self) -> &str {
        match self {
            Envelope::Signed(signed) => &signed.task_id,
            Envelope::Plain(task) => &task.id,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Envelope::Signed(signed) => signed.task_type,
            Envelope::Plain(task) => task.task_type,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            Envelope::Signed(signed) => &signed.account_id,
            Envelope::Plain(task) => &task.account_id,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Envelope::Signed(signed) => signed.priority,
            Envelope::Plain(task) => task.priority,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Envelope::Signed(signed) => signed.retry_count,
            Envelope::Plain(task) => task.retry_count,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Envelope::Signed(_))
    }

    /// The raw payload as stored; ciphertext sentinel for encrypted
    /// signed tasks.
    pub fn data(&self) -> &Value {
        match self {
            Envelope::Signed(signed) => &signed.data,
            Envelope::Plain(task) => &task.data,
        }
    }
}

/// Pending/processing record: an envelope plus queue bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Earliest dequeue time for delayed retries, ms epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedTask {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            not_before: None,
            started_at: None,
            worker_id: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedStatus {
    Completed,
    Failed,
}

/// Terminal record for the completed and failed partitions. Immutable once
/// written; completed entries are purged past the retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedTask {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub status: FinishedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: i64,
}

impl FinishedTask {
    pub fn completed(envelope: Envelope, result: Value) -> Self {
        Self {
            envelope,
            status: FinishedStatus::Completed,
            result: Some(result),
            error: None,
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failed(envelope: Envelope, error: String) -> Self {
        Self {
            envelope,
            status: FinishedStatus::Failed,
            result: None,
            error: Some(error),
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signed_fixture() -> SignedTask {
        SignedTask {
            task_id: "task_abc123".to_string(),
            task_type: TaskType::PostVehicle,
            account_id: "acct_1".to_string(),
            data: json!({"price": 100}),
            data_hash: "00".repeat(32),
            priority: 5,
            created_at: 1_700_000_000_000,
            retry_count: 0,
            signature: "11".repeat(32),
            timestamp: 1_700_000_000_000,
            nonce: "22".repeat(16),
            protocol_version: "1.0".to_string(),
            encrypted_payload: None,
        }
    }

    #[test]
    fn signed_wire_shape_matches_contract() {
        let value = serde_json::to_value(signed_fixture()).unwrap();
        for field in [
            "task_id",
            "type",
            "account_id",
            "data",
            "data_hash",
            "priority",
            "created_at",
            "retry_count",
            "signature",
            "timestamp",
            "nonce",
            "protocol_version",
        ] {
            assert!(value.get(field).is_some(), "missing wire field {field}");
        }
        // optional field absent when unset
        assert!(value.get("encrypted_payload").is_none());
    }

    #[test]
    fn envelope_distinguishes_signed_from_plain() {
        let signed = serde_json::to_value(signed_fixture()).unwrap();
        let envelope: Envelope = serde_json::from_value(signed).unwrap();
        assert!(envelope.is_signed());
        assert_eq!(envelope.task_id(), "task_abc123");

        let task = Task::new(TaskType::PostItem, "acct_2", json!({"item": {}}));
        let plain = serde_json::to_value(&task).unwrap();
        let envelope: Envelope = serde_json::from_value(plain).unwrap();
        assert!(!envelope.is_signed());
        assert_eq!(envelope.account_id(), "acct_2");
    }

    #[test]
    fn queued_task_bookkeeping_survives_roundtrip() {
        let mut record = QueuedTask::new(Envelope::Signed(signed_fixture()));
        record.not_before = Some(123);
        record.worker_id = Some("worker_1".to_string());

        let bytes = serde_json::to_vec(&record).unwrap();
        let back: QueuedTask = serde_json::from_slice(&bytes).unwrap();

        assert!(back.envelope.is_signed());
        assert_eq!(back.not_before, Some(123));
        assert_eq!(back.worker_id.as_deref(), Some("worker_1"));
        assert_eq!(back.started_at, None);
    }

    #[test]
    fn finished_task_records_terminal_state() {
        let task = Task::new(TaskType::ValidateSession, "acct_1", json!({}));
        let finished = FinishedTask::failed(Envelope::Plain(task), "login required".to_string());
        assert_eq!(finished.status, FinishedStatus::Failed);
        assert!(finished.finished_at > 0);

        let bytes = serde_json::to_vec(&finished).unwrap();
        let back: FinishedTask = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.error.as_deref(), Some("login required"));
        assert_eq!(back.status, FinishedStatus::Failed);
    }
}
