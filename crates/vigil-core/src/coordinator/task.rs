//! Task records for the coordinator queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Default task timeout: 60 seconds. Stored on the task and surfaced in
/// status; the coordinator does not run a watchdog against it.
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Dispatch priority. Higher variants are served first; submission time
/// breaks ties (FIFO within a band).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Deferred,
    Low,
    Normal,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Submission parameters; everything beyond the type tag is optional.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: String,
    pub payload: Value,
    pub required_capabilities: BTreeSet<String>,
    pub priority: TaskPriority,
    pub timeout_ms: u64,
    pub metadata: Value,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: Value::Null,
            required_capabilities: BTreeSet::new(),
            priority: TaskPriority::Normal,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            metadata: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One unit of work flowing through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: Value,
    pub required_capabilities: BTreeSet<String>,
    pub priority: TaskPriority,
    pub timeout_ms: u64,
    pub metadata: Value,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub submitted_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec, now_ms: u64) -> Self {
        Self {
            id: generate_task_id(now_ms),
            task_type: spec.task_type,
            payload: spec.payload,
            required_capabilities: spec.required_capabilities,
            priority: spec.priority,
            timeout_ms: spec.timeout_ms,
            metadata: spec.metadata,
            status: TaskStatus::Pending,
            assigned_to: None,
            submitted_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            result: None,
            error: None,
        }
    }
}

/// Task ids are time-prefixed with a random suffix: unique, and sortable
/// enough to read submission order off the id itself.
fn generate_task_id(now_ms: u64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{}-{}", now_ms, &suffix[..8])
}

/// Epoch milliseconds, saturating at 0 if the clock is before 1970.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_serves_higher_first() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert!(TaskPriority::Low > TaskPriority::Deferred);
    }

    #[test]
    fn task_ids_are_prefixed_and_unique() {
        let a = generate_task_id(1_700_000_000_000);
        let b = generate_task_id(1_700_000_000_000);
        assert!(a.starts_with("task-1700000000000-"));
        assert_ne!(a, b);
    }

    #[test]
    fn spec_defaults_are_sane() {
        let spec = TaskSpec::new("transcode");
        assert_eq!(spec.priority, TaskPriority::Normal);
        assert_eq!(spec.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(spec.required_capabilities.is_empty());
    }
}
