//! sl-node: standalone node agent for smoke-testing a hub.
//!
//! Connects with the bearer token from the environment, logs every command
//! it receives and reports a heartbeat until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use sl_bridge::transport::ReconnectPolicy;
use sl_bridge::ws_client::WsConnector;
use sl_core::config::Config;
use sl_core::messages::{
    Announce, BanPlayer, KickPlayer, RunConsoleCommand, ServerHeartbeat, ServerStarted,
    ServerStopping, UnbanPlayer, WhitelistPlayer,
};
use sl_node::{HandlerRegistry, NodeAgent, NodeOptions};
use tracing::{info, warn};
use uuid::Uuid;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// serverlink node agent.
#[derive(Parser)]
#[command(name = "sl-node", version, about)]
struct Cli {
    /// Config file (default: ~/.serverlink/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `node.hub_url`.
    #[arg(long)]
    hub_url: Option<String>,

    /// Override `node.node_id`.
    #[arg(long)]
    node_id: Option<Uuid>,
}

fn smoke_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers
        .on::<KickPlayer, _>(|k, env| {
            info!(command_id = %env.id(), player_id = %k.player_id, reason = ?k.reason, "kick");
            Ok(Some(format!("kicked {}", k.player_id)))
        })
        .on::<BanPlayer, _>(|b, env| {
            info!(command_id = %env.id(), player_id = %b.player_id, minutes = ?b.duration_minutes, "ban");
            Ok(None)
        })
        .on::<UnbanPlayer, _>(|u, env| {
            info!(command_id = %env.id(), player_id = %u.player_id, "unban");
            Ok(None)
        })
        .on::<WhitelistPlayer, _>(|w, env| {
            info!(command_id = %env.id(), player_id = %w.player_id, enabled = w.enabled, "whitelist");
            Ok(None)
        })
        .on::<Announce, _>(|a, env| {
            info!(command_id = %env.id(), message = %a.message, "announce");
            Ok(None)
        })
        .on::<RunConsoleCommand, _>(|c, env| {
            info!(command_id = %env.id(), command = %c.command, "console command");
            Ok(Some(String::new()))
        });
    handlers
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    sl_telemetry::logging::init("sl-node", &config.general.log_level, config.general.json_logs);

    if let Some(url) = cli.hub_url {
        config.node.hub_url = url;
    }
    if let Some(id) = cli.node_id {
        config.node.node_id = Some(id);
    }
    config.validate().context("invalid configuration")?;

    let token = config
        .auth
        .bearer_token()
        .context("node bearer token not available")?;
    let options = NodeOptions::from_config(&config.node)?;
    let connector = Arc::new(WsConnector::node(config.node.hub_url.clone(), token));
    let agent = NodeAgent::new(
        options,
        connector,
        ReconnectPolicy::from_config(&config.reconnect),
        smoke_handlers(),
    );
    agent.start().context("failed to start node agent")?;
    info!(node_id = %agent.node_id(), hub = %config.node.hub_url, "sl-node starting");

    if !agent.wait_connected(Duration::from_secs(10)).await {
        warn!(state = %agent.state(), "not connected yet; continuing in the background");
    }
    agent.publish_event(ServerStarted {
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let started = Instant::now();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(config.node.heartbeat_secs.max(1)));
    heartbeat.tick().await;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                agent.publish_event(ServerHeartbeat {
                    players_online: 0,
                    tick_rate: 20.0,
                    uptime_secs: started.elapsed().as_secs(),
                });
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
                info!("ctrl-c received, stopping");
                break;
            }
        }
    }

    let stopping = ServerStopping {
        reason: Some("shutdown requested".into()),
    };
    if let Err(e) = agent.send_event_now(stopping).await {
        warn!(error = %e, "could not announce shutdown to hub");
    }
    agent.shutdown();
    Ok(())
}
