//! Argus Binary Entry Point
//!
//! This binary runs the complete Argus monitoring orchestrator.
//! Core functionality is provided by the `argus` library crate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use argus::{
    config::AppConfig,
    poller::{PollExecutor, plugin::Plugin},
    prober::Prober,
    registry::{MemStore, Registry},
    scheduler::{EVENT_CAPACITY, Scheduler},
    server::{AppState, create_router},
    sink::{FileSink, RESULT_CAPACITY},
};

/// Argus - Network-Device Monitoring Orchestrator
#[derive(Parser, Debug)]
#[command(name = "argus", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "ARGUS_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "ARGUS_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "ARGUS_SERVER_PORT")]
    server_port: Option<u16>,

    /// Probing executable path (overrides config file)
    #[arg(long, env = "ARGUS_PLUGIN_PATH")]
    plugin_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,argus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Argus - Network-Device Monitoring Orchestrator");

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file
    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(path) = cli.plugin_path {
        config.plugin.path = path;
    }

    tracing::info!(
        "Server: {}:{}, Plugin: {}, Archive: {}",
        config.server.bind,
        config.server.port,
        config.plugin.path.display(),
        config.archive.directory.display(),
    );

    // Populate the registry. The in-process store backs the registry here;
    // a relational mirror plugs in behind the same Store trait.
    let store = Arc::new(MemStore::new());
    let registry = Arc::new(Registry::load(store).await?);

    // Channel wiring: provisioning -> scheduler -> executor -> sink.
    let (provision_tx, provision_rx) = tokio::sync::mpsc::channel(EVENT_CAPACITY);
    let (request_tx, request_rx) = tokio::sync::mpsc::channel(config.poller.queue_capacity);
    let (result_tx, result_rx) = tokio::sync::mpsc::channel(RESULT_CAPACITY);

    let plugin = Plugin::from_config(&config.plugin);

    // Scheduler: admit everything already provisioned, then run the timeline.
    let mut scheduler = Scheduler::new(
        Arc::clone(&registry),
        request_tx,
        provision_rx,
        &config.scheduler,
    );
    scheduler.admit_existing(chrono::Utc::now());
    let scheduler_handle = tokio::spawn(scheduler.run());

    // Poll executor on its bounded pool.
    let executor = PollExecutor::new(
        Arc::clone(&registry),
        plugin.clone(),
        result_tx,
        config.poller.workers,
    );
    let executor_handle = tokio::spawn(executor.run(request_rx));

    // Result archive.
    let sink_handle = FileSink::new(&config.archive.directory).spawn(result_rx);

    // Discovery prober, shared with the management API.
    let prober = Arc::new(Prober::new(
        Arc::clone(&registry),
        plugin,
        config.discovery.clone(),
    ));

    let app_state = AppState {
        registry,
        prober,
        provision_tx,
    };

    // Build Axum router
    let app = create_router(app_state);

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    tracing::info!("Management API listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The server held the provisioning sender; its shutdown closes the
    // scheduler, which closes the executor, which closes the sink.
    tracing::info!("Waiting for pipeline to drain");
    let _ = scheduler_handle.await;
    let _ = executor_handle.await;
    let _ = sink_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
