use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use linkgate::config::Config;
use linkgate::link::session;

/// WhatsApp Web device-linking gateway.
#[derive(Parser)]
#[command(name = "linkgate", about = "WhatsApp Web device-linking gateway", version)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, default_value = "linkgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Delete leftover session directories
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkgate=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            linkgate::gateway::serve(config).await
        }
        Commands::Clean => {
            let root = config.sessions_root();
            let removed = session::purge_all(&root)?;
            info!("removed {removed} session dir(s) under {}", root.display());
            Ok(())
        }
    }
}
