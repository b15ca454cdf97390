use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sl_bridge::auth::TokenValidator;
use sl_bridge::hub::{Hub, HubOptions};
use sl_bridge::ws::hub_router;
use sl_core::config::Config;
use sl_core::outbox::OutboxStore;
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownSignal;

/// How long open sockets get to finish after shutdown before the server task
/// is aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The hub process: websocket and HTTP server, outbox sweeper and graceful
/// shutdown around one [`Hub`].
pub struct HubDaemon {
    config: Config,
    hub: Arc<Hub>,
    shutdown: ShutdownSignal,
}

impl HubDaemon {
    /// Open (or create) the outbox database named in config and build the hub.
    pub async fn new(config: Config) -> Result<Self> {
        let path = expand_home(&config.hub.database_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let outbox = OutboxStore::open(&path)
            .await
            .with_context(|| format!("failed to open outbox at {}", path.display()))?;
        info!(path = %path.display(), "outbox opened");
        Self::with_outbox(config, outbox).await
    }

    /// Build the hub around an already opened outbox. Commands left `Sent` by
    /// a previous process go back to `Pending` before anything connects.
    pub async fn with_outbox(config: Config, outbox: OutboxStore) -> Result<Self> {
        let validator =
            TokenValidator::from_config(&config.auth).context("hub token secret not available")?;
        let options = HubOptions {
            heartbeat: Duration::from_secs(config.hub.heartbeat_secs),
        };
        let hub = Hub::open(outbox, validator, options)
            .await
            .context("failed to recover outbox")?;
        Ok(Self {
            config,
            hub,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A handle that can trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Bind `hub.host:hub.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.hub.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener until shutdown is triggered.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = hub_router(self.hub.clone());

        let server_guard = self.shutdown.guard();
        let stop = self.shutdown.clone();
        let server = tokio::spawn(async move {
            let _guard = server_guard;
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.triggered().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "hub server error");
            }
        });
        info!(%bind_addr, hub_id = %self.hub.hub_id(), "hub listening");

        let sweeper = tokio::spawn(sweep_loop(
            self.hub.clone(),
            Duration::from_secs(self.config.hub.sweep_interval_secs),
            Duration::from_secs(self.config.hub.outbox_max_age_secs),
            self.shutdown.clone(),
        ));

        self.shutdown.triggered().await;
        info!("shutdown signal received, stopping hub");

        // Stops routing; live sockets then only see their heartbeat until closed.
        self.hub.shutdown();
        let mut shutdown = self.shutdown.clone();
        let drained = shutdown.wait_for_drain(2, DRAIN_TIMEOUT).await;
        if !drained.is_complete() {
            warn!(?drained, "hub tasks did not drain in time, aborting");
            server.abort();
            sweeper.abort();
        }
        info!("hub stopped");
        Ok(())
    }
}

async fn sweep_loop(hub: Arc<Hub>, every: Duration, max_age: Duration, shutdown: ShutdownSignal) {
    let _guard = shutdown.guard();
    let mut shutdown_rx = shutdown.subscribe();
    if shutdown.is_shutting_down() {
        return;
    }

    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately; the first sweep waits one interval.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match hub.sweep_expired(max_age).await {
                    Ok(0) => debug!("outbox sweep found nothing to expire"),
                    Ok(expired) => info!(expired, "expired stale outbox entries"),
                    Err(e) => warn!(error = %e, "outbox sweep failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("sweeper stopping");
                break;
            }
        }
    }
}

/// Validate `config` and check the hub secret is present in the environment.
/// Returns the bind address the hub would use.
pub fn check_config(config: &Config) -> Result<String> {
    config.validate().context("invalid configuration")?;
    config
        .auth
        .token_secret()
        .context("hub token secret not available")?;
    Ok(config.hub.bind_addr())
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => Path::new(path).to_path_buf(),
    }
}
