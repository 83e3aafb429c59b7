//! Agent registry records and lifecycle states.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Agent lifecycle. `Disconnected` is transient from the coordinator's view:
/// a disconnected agent is unregistered, not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Discovered,
    Initializing,
    Idle,
    Working,
    Blocked,
    Error,
    Disconnected,
}

impl AgentState {
    pub const ALL: [AgentState; 7] = [
        AgentState::Discovered,
        AgentState::Initializing,
        AgentState::Idle,
        AgentState::Working,
        AgentState::Blocked,
        AgentState::Error,
        AgentState::Disconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Discovered => "discovered",
            AgentState::Initializing => "initializing",
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Blocked => "blocked",
            AgentState::Error => "error",
            AgentState::Disconnected => "disconnected",
        }
    }
}

/// One registered worker: declared capabilities plus running work statistics.
/// Owned by the coordinator registry; callers get clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub metadata: Value,
    pub state: AgentState,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,
    pub tasks_completed: u64,
    pub tasks_in_progress: u32,
    pub total_work_ms: u64,
    /// Derived: `total_work_ms / tasks_completed`, 0 with no history.
    pub average_task_ms: u64,
}

impl AgentRecord {
    pub(crate) fn new(
        id: String,
        capabilities: BTreeSet<String>,
        metadata: Value,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            capabilities,
            metadata,
            state: AgentState::Idle,
            registered_at_ms: now_ms,
            last_heartbeat_ms: now_ms,
            tasks_completed: 0,
            tasks_in_progress: 0,
            total_work_ms: 0,
            average_task_ms: 0,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == AgentState::Idle
    }

    /// Folds one finished task into the running statistics and frees the agent.
    pub(crate) fn record_completion(&mut self, work_ms: u64) {
        self.tasks_completed += 1;
        self.tasks_in_progress = self.tasks_in_progress.saturating_sub(1);
        self.total_work_ms += work_ms;
        self.average_task_ms = self.total_work_ms / self.tasks_completed;
        self.state = AgentState::Idle;
    }
}
