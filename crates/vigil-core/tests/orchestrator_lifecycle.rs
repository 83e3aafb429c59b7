#![cfg(unix)]
//! Orchestrator lifecycle against throwaway unix processes: tier ordering,
//! graceful-stop escalation, restart supervision, and snapshot restore.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vigil_core::{
    McpOrchestrator, OrchestratorConfig, OrchestratorError, OrchestratorEvent,
    OrchestratorSnapshot, OverallHealth, ServerSpec, ServerState,
};

fn fast_config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig {
        state_file: dir.path().join("cache").join("mcp-state.json"),
        startup_settle_ms: 50,
        stop_grace_ms: 300,
        restart_delay_ms: 50,
        restart_settle_ms: 10,
        health_check_interval_ms: 60_000,
        ..Default::default()
    }
}

/// A process that stays up until stopped.
fn sleeper(layer: u8, critical: bool) -> ServerSpec {
    ServerSpec {
        command: "sleep".to_string(),
        args: vec!["30".to_string()],
        layer,
        critical,
    }
}

/// A process that exits immediately with the given code.
fn one_shot(code: i32, layer: u8, critical: bool) -> ServerSpec {
    ServerSpec {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), format!("exit {code}")],
        layer,
        critical,
    }
}

#[tokio::test]
async fn start_all_is_layer_monotonic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([
        ("alpha".to_string(), sleeper(0, true)),
        ("beta".to_string(), sleeper(0, false)),
        ("gamma".to_string(), sleeper(1, false)),
        ("delta".to_string(), sleeper(2, false)),
    ]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    orchestrator.initialize().await.expect("initialize");
    orchestrator.start_all().await.expect("start all");

    let started_at = |name: &str| {
        orchestrator
            .server_entry(name)
            .expect("entry")
            .started_at_ms
            .expect("started")
    };
    assert!(started_at("alpha") <= started_at("gamma"));
    assert!(started_at("beta") <= started_at("gamma"));
    assert!(started_at("gamma") <= started_at("delta"));
    assert_eq!(
        orchestrator.server_state("alpha"),
        Some(ServerState::Running)
    );
    assert_eq!(orchestrator.health().overall, OverallHealth::Healthy);

    orchestrator.shutdown().await.expect("shutdown");
    assert_eq!(
        orchestrator.server_state("alpha"),
        Some(ServerState::Stopped)
    );
    assert_eq!(
        orchestrator.server_state("delta"),
        Some(ServerState::Stopped)
    );
}

#[tokio::test]
async fn critical_server_down_marks_unhealthy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([("core".to_string(), sleeper(0, true))]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    orchestrator.initialize().await.expect("initialize");

    assert_eq!(orchestrator.health().overall, OverallHealth::Unhealthy);

    orchestrator
        .start(&["core".to_string()])
        .await
        .expect("start core");
    let report = orchestrator.health();
    assert_eq!(report.overall, OverallHealth::Healthy);
    assert!(report.servers["core"].pid.is_some());
    assert!(report.servers["core"].critical);

    orchestrator.stop_server("core").await.expect("stop core");
    assert_eq!(orchestrator.health().overall, OverallHealth::Unhealthy);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn starting_twice_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([("solo".to_string(), sleeper(0, false))]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    orchestrator.initialize().await.expect("initialize");

    orchestrator
        .start(&["solo".to_string()])
        .await
        .expect("first start");
    let pid = orchestrator.health().servers["solo"].pid;
    orchestrator.start_server("solo").await.expect("second start");
    assert_eq!(orchestrator.server_state("solo"), Some(ServerState::Running));
    assert_eq!(orchestrator.health().servers["solo"].pid, pid);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unknown_and_uninitialized_are_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(
        fast_config(&dir),
        BTreeMap::new(),
    ));
    assert!(matches!(
        orchestrator.start_all().await,
        Err(OrchestratorError::NotInitialized)
    ));

    orchestrator.initialize().await.expect("initialize");
    assert!(matches!(
        orchestrator.start_server("ghost").await,
        Err(OrchestratorError::UnknownServer(_))
    ));
    // Stopping something that never ran is a reported no-op.
    orchestrator.stop_server("ghost").await.expect("stop ghost");

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn stubborn_server_is_force_killed_within_grace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([(
        "stubborn".to_string(),
        ServerSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
            layer: 0,
            critical: false,
        },
    )]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    orchestrator.initialize().await.expect("initialize");
    orchestrator
        .start(&["stubborn".to_string()])
        .await
        .expect("start");
    assert_eq!(
        orchestrator.server_state("stubborn"),
        Some(ServerState::Running)
    );

    let started = Instant::now();
    orchestrator.stop_server("stubborn").await.expect("stop");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        orchestrator.server_state("stubborn"),
        Some(ServerState::Stopped)
    );

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn critical_server_restarts_after_unexpected_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([("phoenix".to_string(), sleeper(0, true))]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    orchestrator.initialize().await.expect("initialize");
    orchestrator
        .start(&["phoenix".to_string()])
        .await
        .expect("start");

    let pid = orchestrator.health().servers["phoenix"].pid.expect("pid");
    // SAFETY: killing the child we just spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    // Exit monitor -> restart delay (50ms) -> relaunch -> settle (50ms).
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        orchestrator.server_state("phoenix"),
        Some(ServerState::Running)
    );
    assert_eq!(orchestrator.restart_count("phoenix"), 1);
    let new_pid = orchestrator.health().servers["phoenix"].pid.expect("pid");
    assert_ne!(new_pid, pid);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn restart_cap_exhaustion_is_terminal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = OrchestratorConfig {
        max_restarts: 1,
        ..fast_config(&dir)
    };
    let specs = BTreeMap::from([("flappy".to_string(), one_shot(7, 0, true))]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(config, specs));
    orchestrator.initialize().await.expect("initialize");
    orchestrator
        .start(&["flappy".to_string()])
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(orchestrator.server_state("flappy"), Some(ServerState::Error));
    assert_eq!(orchestrator.restart_count("flappy"), 1);

    // No further attempts once the cap is exhausted.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(orchestrator.restart_count("flappy"), 1);
    assert_eq!(orchestrator.server_state("flappy"), Some(ServerState::Error));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn non_critical_exit_is_not_restarted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([("optional".to_string(), one_shot(0, 1, false))]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    orchestrator.initialize().await.expect("initialize");
    orchestrator
        .start(&["optional".to_string()])
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        orchestrator.server_state("optional"),
        Some(ServerState::Error)
    );
    assert_eq!(orchestrator.restart_count("optional"), 0);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn restart_counters_survive_a_new_orchestrator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = OrchestratorConfig {
        max_restarts: 1,
        ..fast_config(&dir)
    };
    let specs = BTreeMap::from([("flappy".to_string(), one_shot(1, 0, true))]);

    let first = Arc::new(McpOrchestrator::with_server_specs(
        config.clone(),
        specs.clone(),
    ));
    first.initialize().await.expect("initialize first");
    first
        .start(&["flappy".to_string()])
        .await
        .expect("start flappy");
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(first.restart_count("flappy"), 1);
    first.shutdown().await.expect("shutdown first");

    // The snapshot on disk carries the counter in camelCase fields.
    let snapshot = OrchestratorSnapshot::load(&config.state_file)
        .expect("load snapshot")
        .expect("snapshot present");
    assert_eq!(snapshot.restart_counts.get("flappy"), Some(&1));

    let second = Arc::new(McpOrchestrator::with_server_specs(config, specs));
    second.initialize().await.expect("initialize second");
    assert_eq!(second.restart_count("flappy"), 1);
    second.shutdown().await.expect("shutdown second");
}

#[tokio::test]
async fn orchestrator_events_trace_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([("solo".to_string(), sleeper(0, false))]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    let mut events = orchestrator.subscribe();

    orchestrator.initialize().await.expect("initialize");
    orchestrator.start_all().await.expect("start all");
    orchestrator.stop_all().await.expect("stop all");
    orchestrator.shutdown().await.expect("shutdown");

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(received
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::ServerStarted { name, .. } if name == "solo")));
    assert!(received
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::AllServersStarted)));
    assert!(received
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::ServerStopped { name } if name == "solo")));
    assert!(received
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::AllServersStopped)));
    assert!(received
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::Shutdown)));
}

#[tokio::test]
async fn status_report_groups_by_layer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let specs = BTreeMap::from([
        ("alpha".to_string(), sleeper(0, true)),
        ("gamma".to_string(), sleeper(1, false)),
    ]);
    let orchestrator = Arc::new(McpOrchestrator::with_server_specs(fast_config(&dir), specs));
    orchestrator.initialize().await.expect("initialize");

    let report = orchestrator.status_report();
    assert!(report.contains("Layer 0:"));
    assert!(report.contains("Layer 1:"));
    assert!(report.contains("alpha"));
    assert!(report.contains("CRITICAL"));
    assert!(report.contains("STOPPED"));

    orchestrator.shutdown().await.expect("shutdown");
}
