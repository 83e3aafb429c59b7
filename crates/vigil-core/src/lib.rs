//! vigil-core: control-tower coordination core.
//!
//! Two components share this crate: the [`coordinator`] (capability-matched
//! agent/task dispatch with heartbeat supervision and an emergence heuristic)
//! and the [`orchestrator`] (tiered MCP subprocess lifecycle with bounded
//! restart supervision and a JSON state snapshot). Each owns its registries
//! outright; consumers receive the component instance explicitly and observe
//! state changes through the broadcast events in [`events`].

pub mod config;
pub mod coordinator;
pub mod events;
pub mod orchestrator;

pub use config::{CoordinatorConfig, OrchestratorConfig, VigilConfig};
pub use coordinator::{
    AgentCoordinator, AgentRecord, AgentState, CoordinatorError, CoordinatorStatus,
    EmergenceEvent, EmergenceSummary, Task, TaskPriority, TaskSpec, TaskStatus,
};
pub use events::{CoordinatorEvent, OrchestratorEvent};
pub use orchestrator::{
    default_server_specs, load_server_specs, HealthReport, McpOrchestrator, OrchestratorError,
    OrchestratorSnapshot, OverallHealth, ServerEntry, ServerHealth, ServerSpec, ServerState,
};
