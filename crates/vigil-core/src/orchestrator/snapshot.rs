//! JSON snapshot of orchestrator state: restart counters and the running
//! set at save time. Restored on initialize to seed the restart counters;
//! `runningServers` is informational only and never drives an auto-resume.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use super::OrchestratorError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorSnapshot {
    /// ISO-8601 save time.
    pub timestamp: String,
    #[serde(default)]
    pub restart_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub running_servers: Vec<String>,
}

impl OrchestratorSnapshot {
    /// Reads a snapshot; a missing file is the fresh-start path, not an error.
    pub fn load(path: &Path) -> Result<Option<Self>, OrchestratorError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), OrchestratorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache").join("mcp-state.json");

        let snapshot = OrchestratorSnapshot {
            timestamp: "2026-08-08T00:00:00Z".to_string(),
            restart_counts: BTreeMap::from([("git".to_string(), 2), ("memory".to_string(), 1)]),
            running_servers: vec!["filesystem".to_string(), "memory".to_string()],
        };
        snapshot.save(&path).expect("save snapshot");

        let restored = OrchestratorSnapshot::load(&path)
            .expect("load snapshot")
            .expect("snapshot present");
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn missing_file_is_fresh_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = OrchestratorSnapshot::load(&dir.path().join("absent.json")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn persisted_field_names_are_camel_case() {
        let snapshot = OrchestratorSnapshot {
            timestamp: "2026-08-08T00:00:00Z".to_string(),
            restart_counts: BTreeMap::from([("git".to_string(), 1)]),
            running_servers: vec!["git".to_string()],
        };
        let json = serde_json::to_string(&snapshot).expect("serialize");
        assert!(json.contains("\"restartCounts\""));
        assert!(json.contains("\"runningServers\""));
    }
}
