use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use roost::config::{self, Config};
use roost::environment::docker;
use roost::remote::{self, PanelClient};
use roost::server::ServerRegistry;
use roost::logging;

#[derive(Parser)]
#[command(name = "roost")]
#[command(about = "Node-local daemon for game server containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Serve {
        /// Path to the daemon configuration file
        #[arg(short, long, default_value = "/etc/roost/config.json", env = "ROOST_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve(config).await,
    }
}

async fn serve(path: PathBuf) -> Result<()> {
    let cfg = if path.exists() {
        Config::load(&path)?
    } else {
        Config::default()
    };

    logging::init(&cfg.log_dir, "roost")?;
    info!(config = %path.display(), "starting roost daemon");

    config::init(cfg.clone());

    docker::configure_client(&cfg.docker).await?;
    remote::configure(PanelClient::new(&cfg.remote.base_url, &cfg.remote.token)?);

    let registry = Arc::new(ServerRegistry::new());

    // Containers from a previous daemon run keep running without us; report
    // what is already on the host before accepting control plane work.
    let managed = docker::managed_containers().await?;
    info!(count = managed.len(), "found existing managed containers");
    for (name, state) in &managed {
        debug!(container = %name, %state, "managed container present on host");
    }

    tokio::signal::ctrl_c().await?;
    info!(servers = registry.len().await, "shutting down");

    Ok(())
}
