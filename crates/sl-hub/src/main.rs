//! sl-hub: the serverlink hub.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sl_core::config::Config;
use sl_hub::daemon::{check_config, HubDaemon};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// serverlink hub.
#[derive(Parser)]
#[command(name = "sl-hub", version, about)]
struct Cli {
    /// Config file (default: ~/.serverlink/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the hub until ctrl-c (default).
    Run {
        /// Override `hub.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate the config and the token secret, then exit.
    CheckConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load_from(path).with_context(|| format!("failed to load {}", path.display()))
        }
        None => Config::load().context("failed to load config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Run { port: None }) {
        Commands::CheckConfig => {
            let addr = check_config(&config)?;
            println!("config ok; hub would listen on {addr}");
            Ok(())
        }
        Commands::Run { port } => {
            sl_telemetry::logging::init("sl-hub", &config.general.log_level, config.general.json_logs);
            if let Some(port) = port {
                config.hub.port = port;
            }
            config.validate().context("invalid configuration")?;

            let daemon = HubDaemon::new(config).await?;
            let shutdown = daemon.shutdown_handle();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("ctrl-c received, initiating shutdown");
                shutdown.trigger();
            });

            info!(version = env!("CARGO_PKG_VERSION"), "sl-hub starting");
            daemon.run().await
        }
    }
}
