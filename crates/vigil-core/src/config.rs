//! Vigil configuration: defaults, then `config/vigil.toml`, then `VIGIL__` env.
//!
//! Every tunable is a named, defaulted field; deployments change behavior
//! without code edits. Intervals are stored as milliseconds so they survive a
//! TOML/env round-trip and are exposed as [`Duration`] accessors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coordinator tunables.
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | heartbeat_interval_ms | 10000 | Cadence of the stale-agent sweep. |
/// | heartbeat_timeout_ms | 30000 | Silence after which an agent is unregistered. |
/// | max_concurrent_tasks | 5 | Dispatch concurrency cap. |
/// | emergence_threshold | 0.7 | Score above which an emergence event is recorded. |
/// | emergence_check_interval_ms | 30000 | Cadence of the periodic emergence check. |
/// | shutdown_poll_ms | 1000 | Poll cadence while draining active tasks. |
/// | shutdown_timeout_ms | 30000 | Hard cap on the drain wait. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_emergence_threshold")]
    pub emergence_threshold: f64,
    #[serde(default = "default_emergence_check_interval_ms")]
    pub emergence_check_interval_ms: u64,
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            emergence_threshold: default_emergence_threshold(),
            emergence_check_interval_ms: default_emergence_check_interval_ms(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn emergence_check_interval(&self) -> Duration {
        Duration::from_millis(self.emergence_check_interval_ms.max(1))
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Orchestrator tunables.
///
/// `auto_start` is the set of servers the daemon launches when `start` is
/// invoked without names; `servers_file` overrides the built-in MCP server
/// registry with a TOML map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_startup_settle_ms")]
    pub startup_settle_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
    #[serde(default = "default_auto_start")]
    pub auto_start: Vec<String>,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub servers_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            startup_settle_ms: default_startup_settle_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_settle_ms: default_restart_settle_ms(),
            auto_start: default_auto_start(),
            state_file: default_state_file(),
            servers_file: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms.max(1))
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

/// Top-level configuration: one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl VigilConfig {
    /// Load config from file and environment.
    /// Precedence: env `VIGIL_CONFIG` path > `config/vigil.toml` > defaults,
    /// with `VIGIL__` environment variables layered on top.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| "config/vigil.toml".to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_emergence_threshold() -> f64 {
    0.7
}

fn default_emergence_check_interval_ms() -> u64 {
    30_000
}

fn default_shutdown_poll_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_startup_settle_ms() -> u64 {
    2_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_restart_settle_ms() -> u64 {
    2_000
}

fn default_auto_start() -> Vec<String> {
    vec![
        "filesystem".to_string(),
        "memory".to_string(),
        "git".to_string(),
    ]
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/vigil/mcp-state.json")
}
