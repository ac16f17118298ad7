//! sshdeck - SSH session and tunnel orchestration
//!
//! Keeps SSH connections to remote hosts alive on behalf of a web dashboard:
//! interactive terminals, remote file operations, host status and persistent
//! host-to-host tunnels, all served over one WebSocket listener.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames, channel buffers)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bridge;
pub mod config;
pub mod services;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod state;
pub mod status;
pub mod tunnel;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge::BridgeServer;
use config::{hosts_file, log_dir, state_file, JsonHostStore, ServerConfig};
use services::Services;
use state::RedbTunnelStore;

/// Write startup log to file (useful when the service dies before logging is up)
pub fn write_startup_log(data_dir: &Path, message: &str) {
    let log_dir = log_dir(data_dir);
    let _ = std::fs::create_dir_all(&log_dir);

    let log_file = log_dir.join("startup.log");
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_file) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(file, "[{}] {}", timestamp, message);
    }
}

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to prepare data directory: {0}")]
    DataDir(#[from] std::io::Error),

    #[error("Failed to open state store: {0}")]
    State(#[from] state::StateError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to resume tunnels: {0}")]
    Tunnels(#[from] tunnel::TunnelError),
}

/// Serve until ctrl-c, then stop tunnels and close every connection.
pub async fn run(config: ServerConfig, data_dir: &Path) -> Result<(), StartupError> {
    write_startup_log(data_dir, "sshdeck starting");
    std::fs::create_dir_all(data_dir)?;

    let tunnel_store = Arc::new(RedbTunnelStore::new(&state_file(data_dir))?);
    let hosts = Arc::new(JsonHostStore::new(hosts_file(data_dir)));
    let services = Arc::new(Services::new(&config, hosts, tunnel_store));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.listen_addr,
            source,
        })?;

    let resumed = services.tunnels.start_auto().await?;
    info!("Resumed {} tunnel(s)", resumed);

    let shutdown = CancellationToken::new();
    let server = Arc::new(BridgeServer::new(services.clone(), config.auth_token.clone()));
    let server_task = tokio::spawn(server.run(listener, shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!("Failed to listen for ctrl-c: {}", e),
    }

    shutdown.cancel();
    if let Err(e) = server_task.await {
        error!("Bridge server task failed: {}", e);
    }
    services.shutdown().await;
    write_startup_log(data_dir, "sshdeck stopped");
    Ok(())
}
