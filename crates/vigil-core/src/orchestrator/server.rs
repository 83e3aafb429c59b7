//! Server registry: launch specs, dependency layers, lifecycle states.
//!
//! Three fixed tiers exist. Layer 0 holds primitives with no dependencies,
//! layer 1 depends on layer 0, layer 2 on both. The orchestrator never
//! verifies those dependencies at runtime; it only sequences start/stop by
//! tier membership.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Number of dependency tiers (layers 0, 1, 2).
pub const LAYER_COUNT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Restarting,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Error => "error",
            ServerState::Restarting => "restarting",
        }
    }

    /// One-glyph marker for the status table.
    pub fn icon(&self) -> &'static str {
        match self {
            ServerState::Stopped => "⚫",
            ServerState::Starting => "🟡",
            ServerState::Running => "🟢",
            ServerState::Stopping => "🟠",
            ServerState::Error => "🔴",
            ServerState::Restarting => "🔵",
        }
    }
}

/// Static launch configuration for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Dependency tier (0, 1, or 2).
    pub layer: u8,
    /// Critical servers mark overall health unhealthy when not running and
    /// are eligible for automatic restart.
    #[serde(default)]
    pub critical: bool,
}

/// One server in the registry: spec plus lifecycle bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEntry {
    pub name: String,
    pub spec: ServerSpec,
    pub state: ServerState,
    pub started_at_ms: Option<u64>,
    pub stopped_at_ms: Option<u64>,
}

impl ServerEntry {
    pub(crate) fn new(name: String, spec: ServerSpec) -> Self {
        Self {
            name,
            spec,
            state: ServerState::Stopped,
            started_at_ms: None,
            stopped_at_ms: None,
        }
    }
}

/// TOML shape for a server-registry override file:
///
/// ```toml
/// [servers.filesystem]
/// command = "npx"
/// args = ["-y", "@modelcontextprotocol/server-filesystem", "."]
/// layer = 0
/// critical = true
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSpec>,
}

/// Loads a server registry override from TOML.
pub fn load_server_specs(
    path: &Path,
) -> Result<BTreeMap<String, ServerSpec>, super::OrchestratorError> {
    let text = std::fs::read_to_string(path)?;
    let file: ServerFile = toml::from_str(&text)?;
    Ok(file.servers)
}

/// The stock MCP server fleet, tiered to avoid circular dependencies.
pub fn default_server_specs(workspace_root: &Path) -> BTreeMap<String, ServerSpec> {
    let root = workspace_root.display().to_string();
    let mut specs = BTreeMap::new();

    // Layer 0: primitives with no dependencies.
    specs.insert(
        "filesystem".to_string(),
        ServerSpec {
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-filesystem".to_string(),
                root.clone(),
            ],
            layer: 0,
            critical: true,
        },
    );
    specs.insert(
        "memory".to_string(),
        ServerSpec {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@modelcontextprotocol/server-memory".to_string()],
            layer: 0,
            critical: true,
        },
    );

    // Layer 1: foundation, depends on layer 0.
    specs.insert(
        "git".to_string(),
        ServerSpec {
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-git".to_string(),
                "--repository".to_string(),
                root,
            ],
            layer: 1,
            critical: true,
        },
    );
    specs.insert(
        "github".to_string(),
        ServerSpec {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@modelcontextprotocol/server-github".to_string()],
            layer: 1,
            critical: false,
        },
    );
    specs.insert(
        "brave-search".to_string(),
        ServerSpec {
            command: "uvx".to_string(),
            args: vec!["mcp-server-brave-search".to_string()],
            layer: 1,
            critical: false,
        },
    );

    // Layer 2: advanced, depends on layers 0 and 1.
    specs.insert(
        "sequential-thinking".to_string(),
        ServerSpec {
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-sequential-thinking".to_string(),
            ],
            layer: 2,
            critical: true,
        },
    );
    specs.insert(
        "postgres".to_string(),
        ServerSpec {
            command: "uvx".to_string(),
            args: vec!["mcp-server-postgres".to_string()],
            layer: 2,
            critical: false,
        },
    );
    specs.insert(
        "everything".to_string(),
        ServerSpec {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@modelcontextprotocol/server-everything".to_string()],
            layer: 2,
            critical: false,
        },
    );

    specs
}
