//! Agent Coordinator: capability-matched task dispatch.
//!
//! An in-memory registry of agents (capability sets, lifecycle state), a
//! priority task queue, and a dispatch loop that matches queued tasks against
//! idle agents. Agents are external actors: they heartbeat through
//! [`AgentCoordinator::record_heartbeat`] and finish work through
//! [`AgentCoordinator::complete_task`]; silence beyond the configured timeout
//! gets them unregistered and their in-flight tasks requeued.
//!
//! All registry/queue/index mutation happens inside one synchronous critical
//! section per operation, so a dispatch pass always sees and leaves a
//! consistent snapshot (capability index in lockstep with the registry,
//! queue sorted, concurrency cap honored).

mod agent;
mod emergence;
mod task;

pub use agent::{AgentRecord, AgentState};
pub use emergence::{EmergenceEvent, EmergenceSummary, EmergenceTracker};
pub use task::{Task, TaskPriority, TaskSpec, TaskStatus};

pub(crate) use task::epoch_ms;

use crate::config::CoordinatorConfig;
use crate::events::{CoordinatorEvent, EVENT_CHANNEL_CAPACITY};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Completed tasks retained for status reporting.
const COMPLETED_HISTORY_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("agent id must not be empty")]
    EmptyAgentId,
    #[error("task type must not be empty")]
    EmptyTaskType,
}

/// Mutable coordinator state. Invariant: `capability_index` holds exactly the
/// capability→agent-id edges derivable from `agents`, and a task is in at
/// most one of `task_queue` / `active_tasks` / `completed`.
struct CoordinatorInner {
    agents: HashMap<String, AgentRecord>,
    capability_index: HashMap<String, HashSet<String>>,
    task_queue: Vec<Task>,
    active_tasks: HashMap<String, Task>,
    completed: VecDeque<Task>,
    emergence: EmergenceTracker,
}

impl CoordinatorInner {
    fn new() -> Self {
        Self {
            agents: HashMap::new(),
            capability_index: HashMap::new(),
            task_queue: Vec::new(),
            active_tasks: HashMap::new(),
            completed: VecDeque::new(),
            emergence: EmergenceTracker::new(),
        }
    }

    fn push_completed(&mut self, task: Task) {
        if self.completed.len() == COMPLETED_HISTORY_CAPACITY {
            self.completed.pop_front();
        }
        self.completed.push_back(task);
    }
}

/// Serializable status rollup for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub timestamp: String,
    pub agents: AgentPoolStatus,
    pub tasks: TaskFlowStatus,
    pub capabilities: CapabilityStatus,
    pub emergence: EmergenceSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentPoolStatus {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub registered: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFlowStatus {
    pub queued: usize,
    pub active: usize,
    pub total_processed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityStatus {
    pub total: usize,
    pub available: Vec<String>,
}

/// The coordinator. Construct with [`AgentCoordinator::new`], wrap in an
/// [`Arc`], and call [`initialize`](AgentCoordinator::initialize) to spawn
/// the heartbeat sweep and periodic emergence check.
pub struct AgentCoordinator {
    config: CoordinatorConfig,
    inner: Mutex<CoordinatorInner>,
    events: broadcast::Sender<CoordinatorEvent>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl AgentCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            inner: Mutex::new(CoordinatorInner::new()),
            events,
            loops: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Receiver for state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Spawns the background loops. Idempotent; a second call only warns.
    pub fn initialize(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("agent coordinator already initialized");
            return;
        }
        info!("initializing agent coordinator");
        self.spawn_heartbeat_sweep();
        self.spawn_emergence_checks();
        self.emit(CoordinatorEvent::Initialized);
        info!("agent coordinator initialized");
    }

    // -----------------------------------------------------------------------
    // Agent registry
    // -----------------------------------------------------------------------

    /// Registers an agent as `idle` and indexes its capabilities.
    /// Re-registering an existing id replaces the record; the old record's
    /// index entries are removed first so the index stays in lockstep.
    pub fn register_agent(
        &self,
        id: &str,
        capabilities: Vec<String>,
        metadata: Value,
    ) -> Result<AgentRecord, CoordinatorError> {
        if id.trim().is_empty() {
            return Err(CoordinatorError::EmptyAgentId);
        }
        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();
        let record = AgentRecord::new(id.to_string(), capabilities.clone(), metadata, epoch_ms());
        {
            let mut inner = self.lock();
            if let Some(previous) = inner.agents.remove(id) {
                warn!(agent_id = %id, "agent re-registered; replacing previous record");
                Self::deindex_agent(&mut inner.capability_index, &previous);
            }
            for capability in &capabilities {
                inner
                    .capability_index
                    .entry(capability.clone())
                    .or_default()
                    .insert(id.to_string());
            }
            inner.agents.insert(id.to_string(), record.clone());
        }
        info!(agent_id = %id, capabilities = ?capabilities, "agent registered");
        self.emit(CoordinatorEvent::AgentRegistered {
            id: id.to_string(),
            capabilities: capabilities.into_iter().collect(),
        });
        Ok(record)
    }

    /// Removes an agent; every task it was working on goes back to the queue
    /// as `pending` with no assignee. Unknown ids are a reported no-op.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let requeued = {
            let mut inner = self.lock();
            let Some(agent) = inner.agents.remove(agent_id) else {
                warn!(agent_id, "unregister requested for unknown agent");
                return false;
            };
            Self::deindex_agent(&mut inner.capability_index, &agent);

            let orphaned: Vec<String> = inner
                .active_tasks
                .values()
                .filter(|t| t.assigned_to.as_deref() == Some(agent_id))
                .map(|t| t.id.clone())
                .collect();
            let mut requeued = Vec::new();
            for task_id in orphaned {
                if let Some(mut task) = inner.active_tasks.remove(&task_id) {
                    task.assigned_to = None;
                    task.status = TaskStatus::Pending;
                    task.started_at_ms = None;
                    inner.task_queue.push(task);
                    requeued.push(task_id);
                }
            }
            Self::sort_queue(&mut inner.task_queue);
            requeued
        };
        for task_id in requeued {
            warn!(agent_id, task_id = %task_id, "requeueing task from removed agent");
            self.emit(CoordinatorEvent::TaskRequeued {
                task_id,
                agent_id: agent_id.to_string(),
            });
        }
        info!(agent_id, "agent unregistered");
        self.emit(CoordinatorEvent::AgentUnregistered {
            id: agent_id.to_string(),
        });
        true
    }

    /// Bumps the agent's liveness timestamp. The external channel driving the
    /// agent calls this; the coordinator never solicits heartbeats itself.
    pub fn record_heartbeat(&self, agent_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_heartbeat_ms = epoch_ms();
                true
            }
            None => {
                warn!(agent_id, "heartbeat from unknown agent");
                false
            }
        }
    }

    /// External lifecycle signal (`blocked`, `error`, `initializing`, ...).
    pub fn update_agent_state(&self, agent_id: &str, state: AgentState) -> bool {
        let mut inner = self.lock();
        match inner.agents.get_mut(agent_id) {
            Some(agent) => {
                debug!(agent_id, state = state.as_str(), "agent state updated");
                agent.state = state;
                true
            }
            None => {
                warn!(agent_id, "state update for unknown agent");
                false
            }
        }
    }

    /// Snapshot of one agent record.
    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.lock().agents.get(agent_id).cloned()
    }

    /// Idle agents whose capability set covers every required tag; with no
    /// requirements, all idle agents. Ordered by registration time.
    pub fn find_agents(&self, required: &BTreeSet<String>) -> Vec<AgentRecord> {
        let inner = self.lock();
        let mut found: Vec<AgentRecord> = Self::idle_candidates(&inner, required)
            .into_iter()
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.registered_at_ms
                .cmp(&b.registered_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        found
    }

    // -----------------------------------------------------------------------
    // Task flow
    // -----------------------------------------------------------------------

    /// Queues a task (priority order, FIFO within a band) and immediately
    /// runs a dispatch pass. Returns the created record.
    pub fn submit_task(&self, spec: TaskSpec) -> Result<Task, CoordinatorError> {
        if spec.task_type.trim().is_empty() {
            return Err(CoordinatorError::EmptyTaskType);
        }
        let task = Task::from_spec(spec, epoch_ms());
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = ?task.priority,
            "task submitted"
        );
        self.emit(CoordinatorEvent::TaskSubmitted {
            id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
        });
        let assignments = {
            let mut inner = self.lock();
            inner.task_queue.push(task.clone());
            Self::sort_queue(&mut inner.task_queue);
            self.assign_queued_tasks(&mut inner)
        };
        self.publish_assignments(assignments);
        Ok(task)
    }

    /// Finishes an active task: updates the agent's statistics, frees it, and
    /// re-runs dispatch so queued work fills the slot. Unknown tasks and
    /// tasks whose agent has vanished are reported no-ops (`false`) that
    /// mutate nothing; late completions after a heartbeat eviction are an
    /// expected race.
    pub fn complete_task(
        &self,
        task_id: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let (agent_id, work_ms, failed, assignments) = {
            let mut inner = self.lock();
            let Some(mut task) = inner.active_tasks.remove(task_id) else {
                warn!(task_id, "completion for task not in the active set");
                return false;
            };
            let known_agent = task
                .assigned_to
                .clone()
                .filter(|id| inner.agents.contains_key(id));
            let Some(agent_id) = known_agent else {
                warn!(task_id, "assigned agent for completed task not found");
                inner.active_tasks.insert(task.id.clone(), task);
                return false;
            };

            let now = epoch_ms();
            let work_ms = now.saturating_sub(task.started_at_ms.unwrap_or(now));
            let failed = error.is_some();
            task.completed_at_ms = Some(now);
            task.status = if failed {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            task.result = result;
            task.error = error;

            if let Some(agent) = inner.agents.get_mut(&agent_id) {
                agent.record_completion(work_ms);
            }
            inner.push_completed(task);
            inner.emergence.total_interactions += 1;

            info!(task_id, agent_id = %agent_id, work_ms, "task completed");
            let assignments = self.assign_queued_tasks(&mut inner);
            (agent_id, work_ms, failed, assignments)
        };
        self.emit(CoordinatorEvent::TaskCompleted {
            task_id: task_id.to_string(),
            agent_id,
            work_ms,
            failed,
        });
        self.publish_assignments(assignments);
        true
    }

    /// Looks a task up across the queue, the active set, and the retained
    /// completion history.
    pub fn task(&self, task_id: &str) -> Option<Task> {
        let inner = self.lock();
        inner
            .active_tasks
            .get(task_id)
            .cloned()
            .or_else(|| inner.task_queue.iter().find(|t| t.id == task_id).cloned())
            .or_else(|| inner.completed.iter().find(|t| t.id == task_id).cloned())
    }

    // -----------------------------------------------------------------------
    // Emergence
    // -----------------------------------------------------------------------

    /// Current emergence level.
    pub fn emergence_level(&self) -> f64 {
        let inner = self.lock();
        inner
            .emergence
            .level(inner.active_tasks.len(), inner.agents.len(), epoch_ms())
    }

    /// Records an emergence event when the level exceeds the configured
    /// threshold; otherwise returns `None`.
    pub fn detect_emergence(&self) -> Option<EmergenceEvent> {
        let event = {
            let mut inner = self.lock();
            let now = epoch_ms();
            let level = inner
                .emergence
                .level(inner.active_tasks.len(), inner.agents.len(), now);
            if level <= self.config.emergence_threshold {
                return None;
            }
            let working = inner
                .agents
                .values()
                .filter(|a| a.state == AgentState::Working)
                .count();
            let event = EmergenceEvent {
                timestamp_ms: now,
                level,
                active_agents: working,
                spontaneous_coordination: inner.emergence.spontaneous_coordination,
                total_interactions: inner.emergence.total_interactions,
            };
            inner.emergence.record_event(event.clone());
            event
        };
        info!(level = event.level, active_agents = event.active_agents, "emergence pattern detected");
        self.emit(CoordinatorEvent::EmergenceDetected {
            level: event.level,
            active_agents: event.active_agents,
        });
        Some(event)
    }

    /// Status rollup: agent pool, task flow, capability tags, emergence.
    pub fn status(&self) -> CoordinatorStatus {
        let inner = self.lock();
        let now = epoch_ms();

        let mut by_state: BTreeMap<String, usize> = AgentState::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for agent in inner.agents.values() {
            *by_state.entry(agent.state.as_str().to_string()).or_default() += 1;
        }
        let mut registered: Vec<String> = inner.agents.keys().cloned().collect();
        registered.sort();
        let mut available: Vec<String> = inner.capability_index.keys().cloned().collect();
        available.sort();

        CoordinatorStatus {
            timestamp: chrono::Utc::now().to_rfc3339(),
            agents: AgentPoolStatus {
                total: inner.agents.len(),
                by_state,
                registered,
            },
            tasks: TaskFlowStatus {
                queued: inner.task_queue.len(),
                active: inner.active_tasks.len(),
                total_processed: inner.emergence.total_interactions,
            },
            capabilities: CapabilityStatus {
                total: inner.capability_index.len(),
                available,
            },
            emergence: inner
                .emergence
                .summary(inner.active_tasks.len(), inner.agents.len(), now),
        }
    }

    /// Stops the background loops, then waits for active tasks to drain,
    /// polling at the configured cadence up to the hard timeout, after which
    /// any still-active tasks are abandoned (logged, not requeued).
    pub async fn shutdown(&self) {
        info!("shutting down agent coordinator");
        for handle in self.lock_loops().drain(..) {
            handle.abort();
        }

        let poll = self.config.shutdown_poll();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        loop {
            let active = self.lock().active_tasks.len();
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(abandoned = active, "drain timeout reached; abandoning active tasks");
                break;
            }
            info!(active, "waiting for active tasks to drain");
            tokio::time::sleep(poll).await;
        }

        self.emit(CoordinatorEvent::Shutdown);
        info!("agent coordinator shutdown complete");
    }

    // -----------------------------------------------------------------------
    // Dispatch internals
    // -----------------------------------------------------------------------

    /// One dispatch pass over the queue. Caller holds the state lock; events
    /// for the returned assignments are published after it is released.
    fn assign_queued_tasks(&self, inner: &mut CoordinatorInner) -> Vec<(String, String)> {
        let mut assigned = Vec::new();
        let cap = self.config.max_concurrent_tasks;
        let mut i = 0;
        while i < inner.task_queue.len() {
            if inner.active_tasks.len() >= cap {
                debug!("max concurrent tasks reached; deferring assignment");
                break;
            }
            let Some(agent_id) = Self::select_agent(inner, &inner.task_queue[i].required_capabilities)
            else {
                // An unsatisfiable task never blocks the rest of the queue.
                debug!(task_id = %inner.task_queue[i].id, "no idle agent satisfies task requirements");
                i += 1;
                continue;
            };

            let mut task = inner.task_queue.remove(i);
            task.assigned_to = Some(agent_id.clone());
            task.started_at_ms = Some(epoch_ms());
            task.status = TaskStatus::InProgress;
            if let Some(agent) = inner.agents.get_mut(&agent_id) {
                agent.state = AgentState::Working;
                agent.tasks_in_progress += 1;
            }
            info!(task_id = %task.id, agent_id = %agent_id, "task assigned");

            let task_id = task.id.clone();
            inner.active_tasks.insert(task_id.clone(), task);
            if inner.active_tasks.len() > 1 {
                inner.emergence.spontaneous_coordination += 1;
            }
            assigned.push((task_id, agent_id));
            // The removal shifted the next queued task into slot `i`.
        }
        assigned
    }

    /// Idle agents holding every required tag, seeded from the first tag's
    /// index bucket (empty requirement: all idle agents).
    fn idle_candidates<'a>(
        inner: &'a CoordinatorInner,
        required: &BTreeSet<String>,
    ) -> Vec<&'a AgentRecord> {
        match required.iter().next() {
            None => inner.agents.values().filter(|a| a.is_idle()).collect(),
            Some(first) => match inner.capability_index.get(first) {
                Some(holders) => holders
                    .iter()
                    .filter_map(|id| inner.agents.get(id))
                    .filter(|a| a.is_idle() && required.is_subset(&a.capabilities))
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    /// Best agent for a requirement set: candidates in registration order, an
    /// agent with no completed-task history wins immediately, otherwise the
    /// lowest average task duration.
    fn select_agent(inner: &CoordinatorInner, required: &BTreeSet<String>) -> Option<String> {
        let mut candidates = Self::idle_candidates(inner, required);
        candidates.sort_by(|a, b| {
            a.registered_at_ms
                .cmp(&b.registered_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(fresh) = candidates.iter().find(|a| a.tasks_completed == 0) {
            return Some(fresh.id.clone());
        }
        candidates
            .iter()
            .min_by_key(|a| a.average_task_ms)
            .map(|a| a.id.clone())
    }

    fn sort_queue(queue: &mut [Task]) {
        queue.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at_ms.cmp(&b.submitted_at_ms))
        });
    }

    fn deindex_agent(index: &mut HashMap<String, HashSet<String>>, agent: &AgentRecord) {
        for capability in &agent.capabilities {
            if let Some(holders) = index.get_mut(capability) {
                holders.remove(&agent.id);
                if holders.is_empty() {
                    index.remove(capability);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    fn spawn_heartbeat_sweep(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.config.heartbeat_interval());
            interval.tick().await; // first tick resolves immediately
            loop {
                interval.tick().await;
                coordinator.sweep_stale_agents();
            }
        });
        self.lock_loops().push(handle);
    }

    fn spawn_emergence_checks(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(coordinator.config.emergence_check_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                coordinator.detect_emergence();
            }
        });
        self.lock_loops().push(handle);
    }

    /// Marks agents silent past the timeout as disconnected and unregisters
    /// them, cascading the task requeue.
    fn sweep_stale_agents(&self) {
        let timeout_ms = self.config.heartbeat_timeout_ms;
        let now = epoch_ms();
        let stale: Vec<(String, u64)> = {
            let mut inner = self.lock();
            let stale: Vec<(String, u64)> = inner
                .agents
                .values()
                .filter(|a| now.saturating_sub(a.last_heartbeat_ms) > timeout_ms)
                .map(|a| (a.id.clone(), now.saturating_sub(a.last_heartbeat_ms)))
                .collect();
            for (id, _) in &stale {
                if let Some(agent) = inner.agents.get_mut(id) {
                    agent.state = AgentState::Disconnected;
                }
            }
            stale
        };
        for (agent_id, silent_ms) in stale {
            warn!(agent_id = %agent_id, silent_ms, "agent heartbeat timed out; unregistering");
            self.unregister_agent(&agent_id);
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn publish_assignments(&self, assignments: Vec<(String, String)>) {
        for (task_id, agent_id) in assignments {
            self.emit(CoordinatorEvent::TaskAssigned { task_id, agent_id });
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine; every event is also logged at its call site.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorInner> {
        // A poisoned lock still holds consistent state; recover the guard.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_loops(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.loops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
