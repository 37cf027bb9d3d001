//! botfleet Orchestrator Daemon
//!
//! Accepts node agent connections, tracks node health and dispatches
//! commands to agents.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bf_core::config::{self, OrchestratorConfig};
use bf_orchestrator::{AgentServer, DigitalOceanProvider, OrchestratorState};

/// How often fleet counters are logged
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "bf-orchestrator")]
#[command(about = "botfleet orchestrator daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("botfleet orchestrator starting...");

    let config = load_config(args.config.as_deref())?;
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    let mut state = OrchestratorState::new(config);
    match DigitalOceanProvider::from_config(&state.config.digitalocean) {
        Ok(provider) => {
            tracing::info!("Provisioning enabled via {}", state.config.digitalocean.api_base);
            state = state.with_cloud(Arc::new(provider));
        }
        Err(e) => tracing::info!("Provisioning disabled: {}", e),
    }
    let state = Arc::new(state);
    let cancel = CancellationToken::new();

    spawn_signal_handler(cancel.clone());

    let health = state.health_monitor().spawn_monitor(cancel.clone());
    let metrics = spawn_metrics_logger(Arc::clone(&state), cancel.clone());

    let server = AgentServer::new(Arc::clone(&state), cancel.clone());
    let result = server.run(&bind_addr).await;

    cancel.cancel();
    let _ = tokio::join!(health, metrics);

    result?;
    tracing::info!("Orchestrator shutdown complete");
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<OrchestratorConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            OrchestratorConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(OrchestratorConfig::default())
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}

fn spawn_metrics_logger(
    state: Arc<OrchestratorState>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_LOG_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = state.metrics.snapshot();
                    tracing::info!(
                        connected = state.channel.connected_nodes().len(),
                        pending = state.channel.pending_count(),
                        commands_sent = snapshot.commands_sent,
                        commands_failed = snapshot.commands_failed,
                        commands_timed_out = snapshot.commands_timed_out,
                        heartbeat_failures = snapshot.heartbeat_failures,
                        "Fleet metrics"
                    );
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}
