//! MCP Orchestrator: tiered subprocess lifecycle management.
//!
//! Servers start layer by layer (0 → 1 → 2, launches inside a tier run
//! concurrently) and stop in strict reverse order so dependents are never
//! orphaned before their dependencies. A per-process monitor task owns each
//! child, forwards its output to the logger, and feeds exit supervision:
//! critical servers that die unexpectedly are restarted up to a cap with a
//! backoff delay; everything else lands in a terminal `error` state that is
//! reported, not retried. Restart counters survive restarts of the
//! orchestrator itself through a JSON snapshot.

mod server;
mod snapshot;

pub use server::{
    default_server_specs, load_server_specs, ServerEntry, ServerFile, ServerSpec, ServerState,
    LAYER_COUNT,
};
pub use snapshot::OrchestratorSnapshot;

use crate::config::OrchestratorConfig;
use crate::events::{OrchestratorEvent, EVENT_CHANNEL_CAPACITY};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator not initialized; call initialize() first")]
    NotInitialized,
    #[error("initialization already in progress")]
    AlreadyInitializing,
    #[error("server '{0}' not found in registry")]
    UnknownServer(String),
    #[error("failed to spawn server '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("server file parse error: {0}")]
    ServerFile(#[from] toml::de::Error),
}

/// Exclusive handle on a running child. The monitor task owns the `Child`
/// itself; this side keeps the pid for signalling, a watch flag that flips
/// when the process exits, and a one-shot trigger that escalates a stuck
/// graceful stop to a kill.
struct ProcessHandle {
    pid: u32,
    exit_rx: watch::Receiver<bool>,
    force_kill: Option<oneshot::Sender<()>>,
}

/// Per-server health row.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub layer: u8,
    pub critical: bool,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Unhealthy,
}

/// Deterministic health rollup: unhealthy iff any critical server is not
/// running.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: String,
    pub servers: BTreeMap<String, ServerHealth>,
    pub overall: OverallHealth,
}

/// The orchestrator. Construct, wrap in an [`Arc`], `initialize()`, then
/// drive with `start_all`/`stop_all` or explicit name lists.
pub struct McpOrchestrator {
    config: OrchestratorConfig,
    servers: DashMap<String, ServerEntry>,
    processes: DashMap<String, ProcessHandle>,
    restart_counts: DashMap<String, u32>,
    events: broadcast::Sender<OrchestratorEvent>,
    health_loop: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    initializing: AtomicBool,
    shutting_down: AtomicBool,
}

impl McpOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            servers: DashMap::new(),
            processes: DashMap::new(),
            restart_counts: DashMap::new(),
            events,
            health_loop: Mutex::new(None),
            initialized: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Like [`new`](Self::new), but with an explicit server registry instead
    /// of the built-in fleet or a `servers_file` override.
    pub fn with_server_specs(
        config: OrchestratorConfig,
        specs: BTreeMap<String, ServerSpec>,
    ) -> Self {
        let orchestrator = Self::new(config);
        for (name, spec) in specs {
            orchestrator
                .servers
                .insert(name.clone(), ServerEntry::new(name, spec));
        }
        orchestrator
    }

    /// Receiver for state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Loads the server registry, restores persisted restart counters, and
    /// spawns the periodic health check. Idempotent; a repeat call warns.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.initialized.load(Ordering::Acquire) {
            warn!("orchestrator already initialized");
            return Ok(());
        }
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyInitializing);
        }
        info!("initializing MCP orchestrator");

        let result = self.initialize_inner().await;
        self.initializing.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                info!("MCP orchestrator initialized");
                self.emit(OrchestratorEvent::Initialized);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "orchestrator initialization failed");
                Err(e)
            }
        }
    }

    async fn initialize_inner(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if let Some(parent) = self.config.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.servers.is_empty() {
            let specs = match &self.config.servers_file {
                Some(path) => server::load_server_specs(path)?,
                None => server::default_server_specs(&self.config.workspace_root),
            };
            for (name, spec) in specs {
                self.servers
                    .insert(name.clone(), ServerEntry::new(name, spec));
            }
        }
        info!(servers = self.servers.len(), "loaded server registry");

        match OrchestratorSnapshot::load(&self.config.state_file) {
            Ok(Some(snapshot)) => {
                info!(
                    path = %self.config.state_file.display(),
                    "restoring persisted restart counters"
                );
                for (name, count) in snapshot.restart_counts {
                    self.restart_counts.insert(name, count);
                }
            }
            Ok(None) => info!("no previous state snapshot; starting fresh"),
            Err(e) => error!(error = %e, "failed to restore state snapshot"),
        }

        self.spawn_health_loop();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Start / stop / restart
    // -----------------------------------------------------------------------

    /// Starts every server, one tier at a time: all of layer 0 concurrently,
    /// wait for the whole tier, then layer 1, then layer 2.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        self.ensure_initialized()?;
        info!("starting all MCP servers in tiered order");
        for layer in 0..LAYER_COUNT {
            let tier = self.tier_members(layer);
            if tier.is_empty() {
                continue;
            }
            info!(layer, servers = ?tier, "starting layer");
            let launches: Vec<_> = tier
                .iter()
                .map(|name| {
                    let orchestrator = Arc::clone(self);
                    async move { orchestrator.start_server(name).await }
                })
                .collect();
            for result in futures_util::future::join_all(launches).await {
                result?;
            }
        }
        info!("all servers started");
        self.emit(OrchestratorEvent::AllServersStarted);
        self.persist_snapshot();
        Ok(())
    }

    /// Starts the named servers sequentially in the order given.
    pub async fn start(self: &Arc<Self>, names: &[String]) -> Result<(), OrchestratorError> {
        self.ensure_initialized()?;
        for name in names {
            self.start_server(name).await?;
        }
        self.persist_snapshot();
        Ok(())
    }

    /// Stops every server in strict reverse tier order (2 → 1 → 0), each
    /// tier's stops issued concurrently.
    pub async fn stop_all(&self) -> Result<(), OrchestratorError> {
        info!("stopping all MCP servers");
        for layer in (0..LAYER_COUNT).rev() {
            let tier = self.tier_members(layer);
            if tier.is_empty() {
                continue;
            }
            let stops: Vec<_> = tier.iter().map(|name| self.stop_server(name)).collect();
            for result in futures_util::future::join_all(stops).await {
                result?;
            }
        }
        info!("all servers stopped");
        self.emit(OrchestratorEvent::AllServersStopped);
        self.persist_snapshot();
        Ok(())
    }

    /// Stops the named servers sequentially.
    pub async fn stop(&self, names: &[String]) -> Result<(), OrchestratorError> {
        for name in names {
            self.stop_server(name).await?;
        }
        self.persist_snapshot();
        Ok(())
    }

    pub async fn restart_all(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        info!("restarting all servers");
        self.stop_all().await?;
        tokio::time::sleep(self.config.restart_settle()).await;
        self.start_all().await
    }

    pub async fn restart(self: &Arc<Self>, names: &[String]) -> Result<(), OrchestratorError> {
        info!(servers = ?names, "restarting servers");
        self.stop(names).await?;
        tokio::time::sleep(self.config.restart_settle()).await;
        self.start(names).await
    }

    /// Spawns one server. Unknown names are an error; an already-running
    /// server is a warn + no-op. Readiness is a bounded settle delay, not a
    /// health probe.
    pub async fn start_server(self: &Arc<Self>, name: &str) -> Result<(), OrchestratorError> {
        let spec = {
            let Some(mut entry) = self.servers.get_mut(name) else {
                return Err(OrchestratorError::UnknownServer(name.to_string()));
            };
            if entry.state == ServerState::Running {
                warn!(server = name, "server already running");
                return Ok(());
            }
            entry.state = ServerState::Starting;
            entry.spec.clone()
        };

        info!(server = name, command = %spec.command, "starting server");
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .env("NODE_ENV", "development")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                if let Some(mut entry) = self.servers.get_mut(name) {
                    entry.state = ServerState::Error;
                }
                error!(server = name, error = %source, "failed to spawn server");
                return Err(OrchestratorError::Spawn {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        self.forward_output(name, &mut child);

        let (exit_tx, exit_rx) = watch::channel(false);
        let (force_tx, force_rx) = oneshot::channel();
        self.processes.insert(
            name.to_string(),
            ProcessHandle {
                pid,
                exit_rx,
                force_kill: Some(force_tx),
            },
        );
        self.spawn_exit_monitor(name.to_string(), child, exit_tx, force_rx);

        // Crude readiness proxy: a fixed, bounded settle delay.
        tokio::time::sleep(self.config.startup_settle()).await;

        if let Some(mut entry) = self.servers.get_mut(name) {
            // Exit supervision may already have moved the entry on (the
            // process died during the settle window); don't clobber that.
            if entry.state == ServerState::Starting {
                entry.state = ServerState::Running;
                entry.started_at_ms = Some(epoch_ms());
            }
        }

        info!(server = name, pid, "server started");
        self.emit(OrchestratorEvent::ServerStarted {
            name: name.to_string(),
            pid,
        });
        Ok(())
    }

    /// Graceful stop: SIGTERM, bounded grace wait, SIGKILL escalation. The
    /// handle is always cleared and the entry marked stopped, whichever path
    /// ended the process. Not-running servers are a warn + no-op.
    pub async fn stop_server(&self, name: &str) -> Result<(), OrchestratorError> {
        if !self.servers.contains_key(name) || !self.processes.contains_key(name) {
            warn!(server = name, "server not running");
            return Ok(());
        }
        if let Some(mut entry) = self.servers.get_mut(name) {
            entry.state = ServerState::Stopping;
        }
        info!(server = name, "stopping server");

        let (pid, mut exit_rx, force_kill) = match self.processes.get_mut(name) {
            Some(mut handle) => (handle.pid, handle.exit_rx.clone(), handle.force_kill.take()),
            None => return Ok(()),
        };

        send_term_signal(pid);

        let grace = self.config.stop_grace();
        let exited = tokio::time::timeout(grace, wait_for_exit(&mut exit_rx))
            .await
            .is_ok();
        if !exited {
            warn!(server = name, "server did not exit gracefully; forcing kill");
            if let Some(force) = force_kill {
                let _ = force.send(());
            }
            // Give the monitor a bounded window to reap the killed process.
            let _ = tokio::time::timeout(grace, wait_for_exit(&mut exit_rx)).await;
        }

        self.processes.remove(name);
        if let Some(mut entry) = self.servers.get_mut(name) {
            entry.state = ServerState::Stopped;
            entry.stopped_at_ms = Some(epoch_ms());
        }

        info!(server = name, "server stopped");
        self.emit(OrchestratorEvent::ServerStopped {
            name: name.to_string(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Health and status
    // -----------------------------------------------------------------------

    pub fn health(&self) -> HealthReport {
        let now = epoch_ms();
        let mut servers = BTreeMap::new();
        let mut overall = OverallHealth::Healthy;

        for entry in self.servers.iter() {
            let pid = self.processes.get(entry.name.as_str()).map(|h| h.pid);
            let uptime_ms = entry
                .started_at_ms
                .map(|started| now.saturating_sub(started))
                .unwrap_or(0);

            if entry.spec.critical && entry.state != ServerState::Running {
                overall = OverallHealth::Unhealthy;
            }

            servers.insert(
                entry.name.clone(),
                ServerHealth {
                    state: entry.state,
                    pid,
                    restarts: self
                        .restart_counts
                        .get(entry.name.as_str())
                        .map(|c| *c)
                        .unwrap_or(0),
                    layer: entry.spec.layer,
                    critical: entry.spec.critical,
                    uptime_ms,
                },
            );
        }

        HealthReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            servers,
            overall,
        }
    }

    /// Human-readable, tier-grouped status table for the CLI.
    pub fn status_report(&self) -> String {
        let report = self.health();
        let mut out = String::new();
        let overall = match report.overall {
            OverallHealth::Healthy => "HEALTHY",
            OverallHealth::Unhealthy => "UNHEALTHY",
        };
        let _ = writeln!(out, "Overall health: {} ({})", overall, report.timestamp);

        for layer in 0..LAYER_COUNT {
            let tier = self.tier_members(layer);
            if tier.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\nLayer {layer}:");
            for name in tier {
                let Some(health) = report.servers.get(&name) else {
                    continue;
                };
                let badge = if health.critical { "CRITICAL" } else { "" };
                let _ = writeln!(
                    out,
                    "  {} {:<25} {:<12} {}",
                    health.state.icon(),
                    name,
                    health.state.as_str().to_uppercase(),
                    badge
                );
                let pid = health
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "N/A".to_string());
                let _ = writeln!(
                    out,
                    "     pid: {:<8} restarts: {}  uptime: {}",
                    pid,
                    health.restarts,
                    format_uptime(health.uptime_ms)
                );
            }
        }
        out
    }

    /// Restart attempts recorded for a server.
    pub fn restart_count(&self, name: &str) -> u32 {
        self.restart_counts.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn server_state(&self, name: &str) -> Option<ServerState> {
        self.servers.get(name).map(|e| e.state)
    }

    pub fn server_entry(&self, name: &str) -> Option<ServerEntry> {
        self.servers.get(name).map(|e| e.clone())
    }

    /// Sets the shutting-down flag (suppressing restarts), stops the health
    /// loop and every tier in reverse order, and persists the final snapshot.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("shutting down MCP orchestrator");
        self.shutting_down.store(true, Ordering::Release);
        if let Some(handle) = self.lock_health_loop().take() {
            handle.abort();
        }
        self.stop_all().await?;
        self.persist_snapshot();
        self.emit(OrchestratorEvent::Shutdown);
        info!("orchestrator shutdown complete");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Supervision internals
    // -----------------------------------------------------------------------

    /// Forwards child stdout/stderr lines to the logger; no structured
    /// protocol is parsed from those streams.
    fn forward_output(&self, name: &str, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{}", line.trim_end());
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    error!(server = %server, "{}", line.trim_end());
                }
            });
        }
    }

    /// The monitor owns the child: it waits for exit (or the force-kill
    /// trigger from a stuck graceful stop), flips the exit flag, and hands
    /// the exit to restart supervision.
    fn spawn_exit_monitor(
        self: &Arc<Self>,
        name: String,
        mut child: Child,
        exit_tx: watch::Sender<bool>,
        mut force_rx: oneshot::Receiver<()>,
    ) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut force_rx => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            let code = status.as_ref().ok().and_then(|s| s.code());
            let _ = exit_tx.send(true);
            warn!(server = %name, code = ?code, "server process exited");
            orchestrator.handle_server_exit(&name).await;
        });
    }

    /// Restart supervision. Deliberate stops and shutdown teardown only mark
    /// the entry stopped; an *unexpected* exit of a critical server below the
    /// restart cap schedules a relaunch after the backoff delay. Non-critical
    /// servers and cap-exhausted ones land in the terminal `error` state.
    async fn handle_server_exit(self: &Arc<Self>, name: &str) {
        self.processes.remove(name);

        let (critical, state) = match self.servers.get(name) {
            Some(entry) => (entry.spec.critical, entry.state),
            None => return,
        };

        if self.shutting_down.load(Ordering::Acquire)
            || state == ServerState::Stopping
            || state == ServerState::Stopped
        {
            if let Some(mut entry) = self.servers.get_mut(name) {
                if entry.state != ServerState::Stopped {
                    entry.state = ServerState::Stopped;
                    entry.stopped_at_ms = Some(epoch_ms());
                }
            }
            return;
        }

        let attempts = self.restart_counts.get(name).map(|c| *c).unwrap_or(0);
        if critical && attempts < self.config.max_restarts {
            self.restart_counts.insert(name.to_string(), attempts + 1);
            info!(
                server = name,
                attempt = attempts + 1,
                max = self.config.max_restarts,
                "restarting critical server"
            );
            if let Some(mut entry) = self.servers.get_mut(name) {
                entry.state = ServerState::Restarting;
            }
            tokio::time::sleep(self.config.restart_delay()).await;
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = self.start_server(name).await {
                error!(server = name, error = %e, "restart attempt failed");
                if let Some(mut entry) = self.servers.get_mut(name) {
                    entry.state = ServerState::Error;
                }
            }
        } else {
            if let Some(mut entry) = self.servers.get_mut(name) {
                entry.state = ServerState::Error;
            }
            error!(
                server = name,
                attempts, critical, "server not restarted; marked error"
            );
        }
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(orchestrator.config.health_check_interval());
            interval.tick().await; // first tick resolves immediately
            loop {
                interval.tick().await;
                let report = orchestrator.health();
                if report.overall == OverallHealth::Healthy {
                    debug!("health check passed");
                    orchestrator.emit(OrchestratorEvent::HealthCheckPassed);
                } else {
                    warn!("health check failed: critical server not running");
                    orchestrator.emit(OrchestratorEvent::HealthCheckFailed);
                }
            }
        });
        *self.lock_health_loop() = Some(handle);
    }

    fn persist_snapshot(&self) {
        let mut running: Vec<String> = self
            .servers
            .iter()
            .filter(|e| e.state == ServerState::Running)
            .map(|e| e.name.clone())
            .collect();
        running.sort();

        let snapshot = OrchestratorSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            restart_counts: self
                .restart_counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            running_servers: running,
        };
        if let Err(e) = snapshot.save(&self.config.state_file) {
            error!(error = %e, "failed to persist state snapshot");
        } else {
            debug!(path = %self.config.state_file.display(), "state snapshot persisted");
        }
    }

    /// Registry members of one layer, name-sorted for determinism.
    fn tier_members(&self, layer: u8) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .iter()
            .filter(|e| e.spec.layer == layer)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    fn ensure_initialized(&self) -> Result<(), OrchestratorError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(OrchestratorError::NotInitialized)
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    fn lock_health_loop(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.health_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<bool>) {
    while !*exit_rx.borrow() {
        if exit_rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn send_term_signal(pid: u32) {
    // SAFETY: signalling a pid we spawned; worst case it is already gone.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_term_signal(_pid: u32) {
    // No graceful signal available; the grace timeout escalates to a kill.
}

fn format_uptime(ms: u64) -> String {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

/// Epoch milliseconds, saturating at 0 if the clock is before 1970.
fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
