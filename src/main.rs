//! Portway relay - NAT traversal control plane
//!
//! Accepts node control channels, manages routes and their public ports,
//! and drives the external tunneling engine.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{parse_port_range, RelayConfig};
use portway_api::ApiServer;
use portway_control::{ControlPlane, Maintenance, TaskTracker};
use portway_engine::{HttpEngineClient, TunnelEngine};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portway relay - expose services behind NAT through registered nodes
#[derive(Parser, Debug)]
#[command(name = "portway-relay")]
#[command(about = "Portway relay - expose services behind NAT through registered nodes")]
#[command(version)]
#[command(long_about = r#"
Portway relay keeps a control channel to every registered node, assigns
public ports to routes and asks the tunneling engine to open tunnels.

EXAMPLES:
  # Start with defaults (API on 0.0.0.0:8080, engine on localhost:18080)
  portway-relay

  # Start from a config file, overriding the port range
  portway-relay --config relay.yaml --port-range 30000-31000

  # Print the effective configuration
  portway-relay --config relay.yaml check-config

ENVIRONMENT VARIABLES:
  PORTWAY_ENGINE_URL     Tunneling engine base URL
  PORTWAY_ENGINE_TOKEN   Bearer token for the tunneling engine
  RUST_LOG               Log filter, overrides --log-level
"#)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address for the HTTP API and node channel endpoint
    #[arg(long)]
    bind_addr: Option<SocketAddr>,

    /// Tunneling engine base URL
    #[arg(long, env = "PORTWAY_ENGINE_URL")]
    engine_url: Option<String>,

    /// Tunneling engine bearer token
    #[arg(long, env = "PORTWAY_ENGINE_TOKEN", hide_env_values = true)]
    engine_token: Option<String>,

    /// Remote port range for routes, as START-END
    #[arg(long)]
    port_range: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration and print the effective settings
    CheckConfig,
}

/// Setup logging; `RUST_LOG` takes precedence over the given level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load the config file if given, then apply command line overrides
fn build_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };

    if let Some(bind_addr) = cli.bind_addr {
        config.api.bind_addr = bind_addr;
    }
    if let Some(url) = &cli.engine_url {
        config.engine.base_url = url.clone();
    }
    if let Some(token) = &cli.engine_token {
        config.engine.token = token.clone();
    }
    if let Some(range) = &cli.port_range {
        config.tunnel.port_range = parse_port_range(range)?;
    }

    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    info!(
        version = env!("PORTWAY_VERSION"),
        commit = env!("PORTWAY_COMMIT"),
        built = env!("PORTWAY_BUILT_AT"),
        "Portway relay starting"
    );

    let engine_config = config.engine_config();
    let engine: Arc<dyn TunnelEngine> = Arc::new(
        HttpEngineClient::new(&engine_config).context("Failed to create engine client")?,
    );
    match engine.health().await {
        Ok(true) => info!("Tunneling engine reachable at {}", engine_config.base_url),
        Ok(false) => warn!(
            "Tunneling engine at {} reports unhealthy; tunnels will fail to start until it recovers",
            engine_config.base_url
        ),
        Err(e) => warn!(
            "Tunneling engine at {} unreachable: {}",
            engine_config.base_url, e
        ),
    }

    let plane = ControlPlane::in_memory(engine, config.control_plane_config());
    info!(
        "Remote port range: {}-{}",
        config.tunnel.port_range.start, config.tunnel.port_range.end
    );

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new(shutdown.clone());

    Arc::new(Maintenance::new(
        plane.liveness.clone(),
        plane.orchestrator.clone(),
        plane.statuses.clone(),
        config.maintenance.tasks.clone(),
    ))
    .spawn_all(&tracker);

    let server = ApiServer::new(config.api_server_config(), plane.clone());
    let limiter = server.limiter();
    tracker.spawn_periodic(
        "rate-limit-gc",
        Duration::from_secs(config.maintenance.bucket_gc_interval_secs),
        move || {
            let limiter = limiter.clone();
            async move {
                limiter.gc();
            }
        },
    );

    let mut server_task = tokio::spawn(server.start(shutdown.clone()));

    let server_result = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server_task => Some(result),
    };

    tracker.shutdown().await;

    let report = plane.orchestrator.stop_all().await;
    info!(
        stopped = report.stopped.len(),
        failed = report.failed.len(),
        "Tunnels stopped"
    );
    for (route_id, reason) in &report.failed {
        warn!(route_id, "Tunnel left open at shutdown: {}", reason);
    }

    let result = match server_result {
        Some(result) => result,
        None => server_task.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("API server error: {:#}", e);
            return Err(e);
        }
        Err(e) => {
            error!("API server task panicked: {}", e);
            return Err(e.into());
        }
    }

    info!("Portway relay stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;
    let config = build_config(&cli)?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            let rendered = serde_yaml::to_string(&config.redacted())
                .context("Failed to serialize config")?;
            println!("{}", rendered);
            Ok(())
        }
        None => run(config).await,
    }
}
