use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use sshdeck_lib::config::{config_file, data_dir, state_file, ConfigStorage};
use sshdeck_lib::state::{RedbTunnelStore, TunnelStore};
use sshdeck_lib::tunnel::TunnelConfig;

#[derive(Parser)]
#[command(name = "sshdeck", version, about = "SSH session and tunnel orchestration service")]
struct Cli {
    /// Data directory (default: ~/.sshdeck)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket service (default)
    Serve {
        /// Override the listen address from config.json
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,

        /// Settings file (default: <data-dir>/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Store tunnel definitions from a JSON array
    ImportTunnels { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    sshdeck_lib::init_logging();

    let base = match cli.data_dir.map(Ok).unwrap_or_else(data_dir) {
        Ok(base) => base,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result: Result<(), String> = runtime.block_on(async {
        let command = cli.command.unwrap_or(Command::Serve {
            listen: None,
            config: None,
        });
        match command {
            Command::Serve { listen, config } => {
                let path = config.unwrap_or_else(|| config_file(&base));
                let mut settings = ConfigStorage::with_path(path)
                    .load()
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(listen) = listen {
                    settings.listen_addr = listen;
                }
                sshdeck_lib::run(settings, &base)
                    .await
                    .map_err(|e| e.to_string())
            }
            Command::ImportTunnels { file } => import_tunnels(&base, &file).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            sshdeck_lib::write_startup_log(&base, &format!("fatal: {}", e));
            ExitCode::FAILURE
        }
    }
}

async fn import_tunnels(base: &std::path::Path, file: &std::path::Path) -> Result<(), String> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let tunnels: Vec<TunnelConfig> =
        serde_json::from_str(&contents).map_err(|e| format!("Invalid tunnel file: {}", e))?;

    std::fs::create_dir_all(base).map_err(|e| e.to_string())?;
    let store = RedbTunnelStore::new(&state_file(base)).map_err(|e| e.to_string())?;
    let count = tunnels.len();
    for tunnel in tunnels {
        tracing::info!("Importing tunnel {} ({})", tunnel.name, tunnel.id);
        store.put(tunnel).await.map_err(|e| e.to_string())?;
    }
    tracing::info!("Imported {} tunnel(s)", count);
    Ok(())
}
