use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Priority range for queue ordering. Higher is more urgent.
pub const MIN_PRIORITY: u8 = 1;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;

/// Closed set of task types the fleet accepts; validated at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PostVehicle,
    PostItem,
    ValidateSession,
    RefreshSession,
    DeleteListing,
    UpdateListing,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::PostVehicle => "post_vehicle",
            TaskType::PostItem => "post_item",
            TaskType::ValidateSession => "validate_session",
            TaskType::RefreshSession => "refresh_session",
            TaskType::DeleteListing => "delete_listing",
            TaskType::UpdateListing => "update_listing",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of work handed from a producer to the worker fleet.
///
/// `data` keeps the raw payload for wire and hash fidelity; the typed,
/// validated projection is [`crate::models::TaskPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub account_id: String,
    pub data: Value,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub created_at: i64,
    #[serde(default)]
    pub retry_count: u32,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Task {
    pub fn new(task_type: TaskType, account_id: impl Into<String>, data: Value) -> Self {
        Self {
            id: generate_task_id(),
            task_type,
            account_id: account_id.into(),
            data,
            priority: DEFAULT_PRIORITY,
            created_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn clamped_priority(&self) -> u8 {
        self.priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
    }
}

/// Generate a task id of the form `task_<hex-seconds><hex-random>`.
pub fn generate_task_id() -> String {
    let ts = chrono::Utc::now().timestamp() as u64;
    let random: [u8; 8] = rand::rng().random();
    format!("task_{:x}{}", ts, hex::encode(random))
}
