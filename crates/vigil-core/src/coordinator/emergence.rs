//! Emergence heuristic: a scalar in [0, 1] summarizing concurrent
//! multi-agent activity. A toy KPI for the dashboard, not a correctness
//! property; the blend weights are fixed and deliberately simple.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Events inside this window count toward the "recent patterns" term.
const RECENT_WINDOW_MS: u64 = 300_000;

/// Ring capacity for the event log; the recency window only ever looks at
/// the tail, so the cap does not change the score.
const EVENT_LOG_CAPACITY: usize = 256;

/// One detected emergence episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergenceEvent {
    pub timestamp_ms: u64,
    pub level: f64,
    /// Agents in the `working` state at detection time.
    pub active_agents: usize,
    pub spontaneous_coordination: u64,
    pub total_interactions: u64,
}

/// Counters plus the bounded event log.
#[derive(Debug, Default)]
pub struct EmergenceTracker {
    /// Completed tasks since startup.
    pub total_interactions: u64,
    /// Assignments made while at least one other task was already active.
    pub spontaneous_coordination: u64,
    events: VecDeque<EmergenceEvent>,
    pub last_emergence_ms: Option<u64>,
}

/// Snapshot of the tracker for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergenceSummary {
    pub total_interactions: u64,
    pub spontaneous_coordination: u64,
    pub recorded_events: usize,
    pub last_emergence_ms: Option<u64>,
    pub emergence_level: f64,
}

impl EmergenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weighted blend: 0.4 coordination ratio + 0.3 active/agent ratio +
    /// 0.3 recent-pattern saturation (10 events in 5 minutes saturates).
    /// Zero until the first interaction completes.
    pub fn level(&self, active_tasks: usize, agent_count: usize, now_ms: u64) -> f64 {
        if self.total_interactions == 0 {
            return 0.0;
        }

        let coordination_ratio =
            self.spontaneous_coordination as f64 / self.total_interactions as f64;
        let active_ratio = active_tasks as f64 / agent_count.max(1) as f64;
        let recent = self
            .events
            .iter()
            .filter(|e| now_ms.saturating_sub(e.timestamp_ms) < RECENT_WINDOW_MS)
            .count();

        let level = coordination_ratio * 0.4
            + active_ratio * 0.3
            + (recent as f64 / 10.0).min(1.0) * 0.3;

        level.clamp(0.0, 1.0)
    }

    pub fn record_event(&mut self, event: EmergenceEvent) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.last_emergence_ms = Some(event.timestamp_ms);
        self.events.push_back(event);
    }

    pub fn recorded_events(&self) -> usize {
        self.events.len()
    }

    pub fn summary(
        &self,
        active_tasks: usize,
        agent_count: usize,
        now_ms: u64,
    ) -> EmergenceSummary {
        EmergenceSummary {
            total_interactions: self.total_interactions,
            spontaneous_coordination: self.spontaneous_coordination,
            recorded_events: self.events.len(),
            last_emergence_ms: self.last_emergence_ms,
            emergence_level: self.level(active_tasks, agent_count, now_ms),
        }
    }
}
