//! State-change notifications for dashboards and CLIs.
//!
//! Both components own a `tokio::sync::broadcast` sender and hand out
//! receivers via `subscribe()`. Delivery is at-least-once for live,
//! keeping-up subscribers; a lagging receiver may observe a `Lagged` gap,
//! which is why every event is also written to the log at its call site.

use serde::{Deserialize, Serialize};

use crate::coordinator::TaskPriority;

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Coordinator lifecycle and task-flow notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CoordinatorEvent {
    Initialized,
    AgentRegistered {
        id: String,
        capabilities: Vec<String>,
    },
    AgentUnregistered {
        id: String,
    },
    TaskSubmitted {
        id: String,
        task_type: String,
        priority: TaskPriority,
    },
    TaskAssigned {
        task_id: String,
        agent_id: String,
    },
    /// A task went back to the queue because its agent disappeared.
    TaskRequeued {
        task_id: String,
        agent_id: String,
    },
    TaskCompleted {
        task_id: String,
        agent_id: String,
        work_ms: u64,
        failed: bool,
    },
    EmergenceDetected {
        level: f64,
        active_agents: usize,
    },
    Shutdown,
}

/// Orchestrator lifecycle and supervision notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    Initialized,
    ServerStarted { name: String, pid: u32 },
    ServerStopped { name: String },
    AllServersStarted,
    AllServersStopped,
    HealthCheckPassed,
    HealthCheckFailed,
    Shutdown,
}
