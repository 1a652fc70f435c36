//! byte-drain: TCP throughput benchmark
//!
//! - `byte-drain server` accepts connections and drains them, logging
//!   bytes received and elapsed time per session
//! - `byte-drain client` runs one or more clients that each push a single
//!   framed payload and log bytes sent and elapsed time
//!
//! Configuration via CLI arguments or TOML file.

use std::sync::Arc;

use byte_drain::config::{ClientSettings, Config, Role, ServerSettings};
use byte_drain::{run_clients, LogReporter, Server};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.role {
        Role::Server(settings) => run_server(settings).await,
        Role::Client(settings) => run_client(settings).await,
    }
}

/// Run the server until Ctrl-C, then drain sessions
async fn run_server(settings: ServerSettings) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %settings.listen,
        pool_size = settings.pool_size,
        drain_grace_secs = settings.drain_grace.as_secs(),
        "Starting byte-drain server"
    );

    let server = Arc::new(Server::new(settings, Arc::new(LogReporter)));

    let shutdown = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    server.stop().await;
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    });

    match server.start().await {
        Ok(()) => {
            // start() only returns Ok once stop() is under way
            join_shutdown(shutdown).await;
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            shutdown.abort();
            server.stop().await;
            Err(e.into())
        }
    }
}

/// Wait for the shutdown task, logging it if it panicked or was cancelled.
/// Returns whether it ran to completion.
async fn join_shutdown(shutdown: JoinHandle<()>) -> bool {
    match shutdown.await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Shutdown task failed");
            false
        }
    }
}

/// Run the configured number of clients and summarise their results
async fn run_client(settings: ClientSettings) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        target_addr = %settings.target,
        clients = settings.clients,
        volume = settings.volume.amount,
        unit = settings.volume.unit.name(),
        "Starting byte-drain clients"
    );

    let results = run_clients(&settings).await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    let sent: u64 = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|stats| stats.bytes)
        .sum();
    info!(
        clients = results.len(),
        failed,
        total_bytes = sent,
        "All clients finished"
    );

    if failed > 0 {
        return Err(format!("{failed} of {} clients failed", results.len()).into());
    }
    Ok(())
}
