use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Top-level configuration loaded from `~/.serverlink/config.toml`.
///
/// **Security**: this struct never stores the token secret or bearer tokens.
/// Those are read from the environment variables named in [`AuthConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load config from `~/.serverlink/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hub.validate()?;
        self.node.validate()?;
        self.reconnect.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    /// `~/.serverlink`, or `./.serverlink` when no home directory exists.
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".serverlink")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_hub_host")]
    pub host: String,
    #[serde(default = "default_hub_port")]
    pub port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Interval of the `ping` frame sent on every live socket.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Non-terminal outbox entries older than this are failed as expired.
    #[serde(default = "default_outbox_max_age_secs")]
    pub outbox_max_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_hub_host(),
            port: default_hub_port(),
            database_path: default_database_path(),
            heartbeat_secs: default_heartbeat_secs(),
            outbox_max_age_secs: default_outbox_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl HubConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Validation("hub.port must be > 0".into()));
        }
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::Validation("hub.heartbeat_secs must be > 0".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "hub.sweep_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_hub_host() -> String {
    "127.0.0.1".into()
}
fn default_hub_port() -> u16 {
    7420
}
fn default_database_path() -> String {
    "~/.serverlink/outbox.db".into()
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_outbox_max_age_secs() -> u64 {
    7 * 24 * 3600
}
fn default_sweep_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Base websocket URL of the hub, e.g. `ws://127.0.0.1:7420`.
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    /// Must match the `nodeId` claim of the node's bearer token.
    #[serde(default)]
    pub node_id: Option<Uuid>,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    #[serde(default = "default_node_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            node_id: None,
            dedup_capacity: default_dedup_capacity(),
            dispatch_workers: default_dispatch_workers(),
            heartbeat_secs: default_node_heartbeat_secs(),
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Validation("node.dedup_capacity must be > 0".into()));
        }
        if self.dispatch_workers == 0 {
            return Err(ConfigError::Validation(
                "node.dispatch_workers must be > 0".into(),
            ));
        }
        // No TLS backend is built in; terminate TLS in front of the hub.
        if !self.hub_url.starts_with("ws://") {
            return Err(ConfigError::Validation(format!(
                "node.hub_url '{}' must use ws://",
                self.hub_url
            )));
        }
        Ok(())
    }
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:7420".into()
}
fn default_dedup_capacity() -> usize {
    1000
}
fn default_dispatch_workers() -> usize {
    2
}
fn default_node_heartbeat_secs() -> u64 {
    15
}

/// Backoff schedules for the managed connection.
///
/// Each list is an ordered sequence of waits; the last value is reused for
/// every later attempt of the manual layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_manual_delays")]
    pub manual_delays_secs: Vec<u64>,
    #[serde(default = "default_manual_max_attempts")]
    pub manual_max_attempts: u32,
    #[serde(default = "default_true")]
    pub automatic_enabled: bool,
    #[serde(default = "default_automatic_delays")]
    pub automatic_delays_secs: Vec<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            manual_delays_secs: default_manual_delays(),
            manual_max_attempts: default_manual_max_attempts(),
            automatic_enabled: true,
            automatic_delays_secs: default_automatic_delays(),
        }
    }
}

impl ReconnectConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.manual_delays_secs.is_empty() {
            return Err(ConfigError::Validation(
                "reconnect.manual_delays_secs must not be empty".into(),
            ));
        }
        if self.automatic_enabled && self.automatic_delays_secs.is_empty() {
            return Err(ConfigError::Validation(
                "reconnect.automatic_delays_secs must not be empty when enabled".into(),
            ));
        }
        if self.manual_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "reconnect.manual_max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn manual_delays(&self) -> Vec<Duration> {
        self.manual_delays_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    pub fn automatic_delays(&self) -> Vec<Duration> {
        self.automatic_delays_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }
}

fn default_manual_delays() -> Vec<u64> {
    vec![0, 2, 10, 30]
}
fn default_manual_max_attempts() -> u32 {
    10
}
fn default_automatic_delays() -> Vec<u64> {
    vec![0, 1, 3, 5, 10]
}
fn default_true() -> bool {
    true
}

/// Names of the environment variables holding credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Hub side: HMAC secret used to verify bearer tokens.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    /// Node / observer side: the bearer token presented at handshake.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Clock skew tolerated when checking `exp`.
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            token_env: default_token_env(),
            leeway_secs: default_leeway_secs(),
        }
    }
}

impl AuthConfig {
    pub fn token_secret(&self) -> Result<String, ConfigError> {
        read_credential(&self.secret_env)
    }

    pub fn bearer_token(&self) -> Result<String, ConfigError> {
        read_credential(&self.token_env)
    }
}

fn read_credential(var: &str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::MissingCredential(var.to_string())),
    }
}

fn default_secret_env() -> String {
    "SERVERLINK_TOKEN_SECRET".into()
}
fn default_token_env() -> String {
    "SERVERLINK_NODE_TOKEN".into()
}
fn default_leeway_secs() -> u64 {
    30
}
