//! Vigil Control-Tower Daemon
//!
//! Hosts the MCP orchestrator (tiered server lifecycle + restart supervision)
//! and, on request, the agent coordinator loops. Thin CLI over vigil-core:
//!
//!   vigil-daemon start [name ...|--all]    start servers (default: auto-start list)
//!   vigil-daemon stop [name ...|--all]     stop servers
//!   vigil-daemon restart [name ...|--all]  restart servers
//!   vigil-daemon status                    tier-grouped status table
//!   vigil-daemon health                    health report as JSON
//!   vigil-daemon coordinate                run the agent coordinator until Ctrl-C
//!
//! `--debug` raises the default log filter to debug.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{AgentCoordinator, McpOrchestrator, VigilConfig};

const USAGE: &str = "\
Usage: vigil-daemon <command> [name ...] [--all] [--debug]

Commands:
  start [name ...|--all]    Start MCP servers (default: the auto-start list)
  stop [name ...|--all]     Stop MCP servers (default: all)
  restart [name ...|--all]  Restart MCP servers (default: all)
  status                    Print the tier-grouped status table
  health                    Print the health report as JSON
  coordinate                Run the agent coordinator loops until Ctrl-C
";

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[vigil-daemon] .env not loaded: {} (using system environment)", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let debug = args.iter().any(|a| a == "--debug");
    let all = args.iter().any(|a| a == "--all");
    let mut positional = args.iter().filter(|a| !a.starts_with("--"));
    let command = positional.next().cloned();
    let names: Vec<String> = positional.cloned().collect();

    let default_filter = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match VigilConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[vigil-daemon] failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let Some(command) = command else {
        eprint!("{USAGE}");
        std::process::exit(1);
    };

    if let Err(e) = run(&command, names, all, config).await {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(
    command: &str,
    names: Vec<String>,
    all: bool,
    config: VigilConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if command == "coordinate" {
        let coordinator = Arc::new(AgentCoordinator::new(config.coordinator));
        coordinator.initialize();
        tracing::info!("agent coordinator running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Ctrl-C received; shutting down coordinator");
        coordinator.shutdown().await;
        return Ok(());
    }

    let auto_start = config.orchestrator.auto_start.clone();
    let orchestrator = Arc::new(McpOrchestrator::new(config.orchestrator));
    orchestrator.initialize().await?;

    match command {
        "start" => {
            if all {
                orchestrator.start_all().await?;
            } else {
                let list = if names.is_empty() { auto_start } else { names };
                orchestrator.start(&list).await?;
            }
            tracing::info!("servers started; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("Ctrl-C received; shutting down");
            orchestrator.shutdown().await?;
        }
        "stop" => {
            if all || names.is_empty() {
                orchestrator.stop_all().await?;
            } else {
                orchestrator.stop(&names).await?;
            }
            orchestrator.shutdown().await?;
        }
        "restart" => {
            if all || names.is_empty() {
                orchestrator.restart_all().await?;
            } else {
                orchestrator.restart(&names).await?;
            }
            tracing::info!("servers restarted; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("Ctrl-C received; shutting down");
            orchestrator.shutdown().await?;
        }
        "status" => {
            println!("{}", orchestrator.status_report());
            orchestrator.shutdown().await?;
        }
        "health" => {
            println!("{}", serde_json::to_string_pretty(&orchestrator.health())?);
            orchestrator.shutdown().await?;
        }
        other => {
            eprintln!("unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}
