use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sl_core::config::ReconnectConfig;
use sl_telemetry::metrics::{global_metrics, names};

use crate::protocol::Frame;

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// A single frame could not be decoded; the channel itself is intact.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake rejected: unauthorized")]
    Unauthorized,

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("no tokio runtime available")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, TransportError>;

// ---------------------------------------------------------------------------
// TransportKind / ConnectionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    InProcess,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::InProcess => write!(f, "in-process"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ProxyTransport: one established duplex channel
// ---------------------------------------------------------------------------

/// An established channel carrying [`Frame`]s.
///
/// `send` and `recv` may be called concurrently from different tasks. `recv`
/// returns [`TransportError::Serialization`] for a frame that failed to
/// decode (the channel stays usable) and [`TransportError::ConnectionClosed`]
/// once the peer is gone.
#[async_trait]
pub trait ProxyTransport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    async fn send(&self, frame: Frame) -> Result<()>;

    async fn recv(&self) -> Result<Frame>;

    /// Gracefully close. Idempotent.
    async fn close(&self);
}

/// Opens new transports; called once per (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn ProxyTransport>>;

    /// Short label for logs (e.g. the target URL without credentials).
    fn describe(&self) -> String {
        "connector".to_string()
    }
}

// ---------------------------------------------------------------------------
// InProcessTransport: for tests and in-memory wiring
// ---------------------------------------------------------------------------

/// An in-process transport backed by flume channels.
///
/// Closing one half (or dropping it) makes the peer's `recv` fail with
/// [`TransportError::ConnectionClosed`].
pub struct InProcessTransport {
    tx: Mutex<Option<flume::Sender<Frame>>>,
    rx: flume::Receiver<Frame>,
}

impl InProcessTransport {
    /// Create a pair of connected in-process transports.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = flume::unbounded();
        let (tx_b, rx_a) = flume::unbounded();
        let a = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: rx_a,
        };
        let b = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: rx_b,
        };
        (a, b)
    }

    fn sender(&self) -> Option<flume::Sender<Frame>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ProxyTransport for InProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let tx = self.sender().ok_or(TransportError::NotConnected)?;
        tx.send_async(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Frame> {
        if self.sender().is_none() {
            return Err(TransportError::ConnectionClosed);
        }
        self.rx
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

/// Backoff schedules for [`ManagedConnection`].
///
/// After an unexpected drop the automatic layer (one attempt per listed
/// delay) runs first, then the manual layer: its delays in order, the last
/// one reused, until `max_attempts` manual attempts have been made. The
/// initial connect uses the manual layer only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub manual: Vec<Duration>,
    pub max_attempts: u32,
    pub automatic: Option<Vec<Duration>>,
}

impl ReconnectPolicy {
    pub fn new(manual: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            manual,
            max_attempts,
            automatic: None,
        }
    }

    pub fn with_automatic(mut self, delays: Vec<Duration>) -> Self {
        self.automatic = Some(delays);
        self
    }

    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        let policy = Self::new(cfg.manual_delays(), cfg.manual_max_attempts);
        if cfg.automatic_enabled {
            policy.with_automatic(cfg.automatic_delays())
        } else {
            policy
        }
    }

    /// Delay before manual attempt `attempt` (0-based); the last entry is reused.
    pub fn manual_delay(&self, attempt: usize) -> Duration {
        self.manual
            .get(attempt)
            .or_else(|| self.manual.last())
            .copied()
            .unwrap_or_default()
    }

    pub fn initial_schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts as usize)
            .map(|i| self.manual_delay(i))
            .collect()
    }

    pub fn reconnect_schedule(&self) -> Vec<Duration> {
        let mut schedule = self.automatic.clone().unwrap_or_default();
        schedule.extend(self.initial_schedule());
        schedule
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

// ---------------------------------------------------------------------------
// ManagedConnection
// ---------------------------------------------------------------------------

struct ConnInner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    current: Mutex<Option<Arc<dyn ProxyTransport>>>,
    inbound: flume::Sender<Frame>,
}

impl ConnInner {
    fn current(&self) -> MutexGuard<'_, Option<Arc<dyn ProxyTransport>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, target_desc = %self.connector.describe(), "connection state changed");
        }
    }
}

/// A reconnecting duplex channel.
///
/// [`ManagedConnection::connect`] starts a supervisor task that establishes a
/// transport through the [`Connector`], forwards every inbound frame to
/// [`ManagedConnection::inbound`] and, when the transport drops unexpectedly,
/// retries on the [`ReconnectPolicy`] schedule. Cancellation is checked at
/// every backoff step.
pub struct ManagedConnection {
    inner: Arc<ConnInner>,
    inbound_rx: flume::Receiver<Frame>,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedConnection {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnInner {
                connector,
                policy,
                state,
                current: Mutex::new(None),
                inbound: inbound_tx,
            }),
            inbound_rx,
            cancel,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start connecting in the background. A no-op while a supervisor is
    /// already running. Must be called from within a Tokio runtime.
    pub fn connect(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        self.cancel.send_replace(false);
        self.inner.set_state(ConnectionState::Connecting);
        let inner = self.inner.clone();
        let cancel = self.cancel.subscribe();
        *task = Some(handle.spawn(supervise(inner, cancel)));
        Ok(())
    }

    /// Stop any reconnect loop and release the channel. Synchronous and idempotent.
    pub fn disconnect(&self) {
        self.cancel.send_replace(true);
        if let Some(task) = self.task().take() {
            task.abort();
        }
        if let Some(transport) = self.inner.current().take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { transport.close().await });
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Send over the live transport; fails with `NotConnected` otherwise.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let transport = self
            .inner
            .current()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        transport.send(frame).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection reaches `state`. `false` on timeout.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state_changes();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Frames received from the peer, across reconnects. Heartbeat pings are
    /// consumed by the connection and never appear here.
    pub fn inbound(&self) -> flume::Receiver<Frame> {
        self.inbound_rx.clone()
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Resolves once cancellation is requested or the owning connection is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}

async fn supervise(inner: Arc<ConnInner>, mut cancel: watch::Receiver<bool>) {
    let mut schedule = inner.policy.initial_schedule();
    loop {
        let Some(transport) = establish(&inner, &mut cancel, &schedule).await else {
            inner.set_state(ConnectionState::Disconnected);
            return;
        };
        let transport: Arc<dyn ProxyTransport> = Arc::from(transport);
        if *cancel.borrow() {
            transport.close().await;
            return;
        }
        *inner.current() = Some(transport.clone());
        inner.set_state(ConnectionState::Connected);
        tracing::info!(target_desc = %inner.connector.describe(), kind = %transport.kind(), "connection established");

        let reason = tokio::select! {
            reason = read_loop(&inner, transport.as_ref()) => reason,
            _ = cancelled(&mut cancel) => None,
        };
        inner.current().take();

        let Some(reason) = reason else {
            transport.close().await;
            inner.set_state(ConnectionState::Disconnected);
            return;
        };
        tracing::warn!(target_desc = %inner.connector.describe(), error = %reason, "connection lost; reconnecting");
        inner.set_state(ConnectionState::Reconnecting);
        schedule = inner.policy.reconnect_schedule();
    }
}

/// Walk `schedule`, one connect attempt per entry. `None` when cancelled,
/// rejected, or out of attempts.
async fn establish(
    inner: &ConnInner,
    cancel: &mut watch::Receiver<bool>,
    schedule: &[Duration],
) -> Option<Box<dyn ProxyTransport>> {
    for (attempt, delay) in schedule.iter().enumerate() {
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = cancelled(cancel) => return None,
            }
        }
        if *cancel.borrow() {
            return None;
        }
        global_metrics().increment_counter(names::RECONNECT_ATTEMPTS_TOTAL, &[]);
        let result = tokio::select! {
            r = inner.connector.connect() => r,
            _ = cancelled(cancel) => return None,
        };
        match result {
            Ok(transport) => return Some(transport),
            Err(TransportError::Unauthorized) => {
                tracing::error!(
                    target_desc = %inner.connector.describe(),
                    "hub rejected credentials; not retrying"
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    target_desc = %inner.connector.describe(),
                    attempt = attempt + 1,
                    of = schedule.len(),
                    error = %e,
                    "connect attempt failed"
                );
            }
        }
    }
    tracing::error!(
        target_desc = %inner.connector.describe(),
        attempts = schedule.len(),
        "ALARM: connection attempts exhausted; staying disconnected"
    );
    None
}

/// Pump inbound frames until the transport fails. Returns the reason.
async fn read_loop(inner: &ConnInner, transport: &dyn ProxyTransport) -> Option<TransportError> {
    loop {
        match transport.recv().await {
            Ok(Frame::Ping(_)) => tracing::trace!("heartbeat received"),
            Ok(frame) => {
                if inner.inbound.send(frame).is_err() {
                    return None;
                }
            }
            Err(TransportError::Serialization(e)) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
            }
            Err(e) => return Some(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandAck;
    use uuid::Uuid;

    #[tokio::test]
    async fn in_process_pair_send_recv() {
        let (a, b) = InProcessTransport::pair();
        a.send(Frame::ping()).await.unwrap();
        assert!(matches!(b.recv().await.unwrap(), Frame::Ping(_)));

        let ack = CommandAck::completed(Uuid::new_v4(), None);
        b.send(Frame::AcknowledgeCommand(ack.clone())).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Frame::AcknowledgeCommand(ack));
    }

    #[tokio::test]
    async fn closing_one_half_closes_peer() {
        let (a, b) = InProcessTransport::pair();
        a.close().await;
        a.close().await;
        assert!(matches!(a.send(Frame::ping()).await, Err(TransportError::NotConnected)));
        assert!(matches!(b.recv().await, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn transport_kind_display_and_serialize() {
        assert_eq!(TransportKind::InProcess.to_string(), "in-process");
        let json = serde_json::to_string(&TransportKind::WebSocket).unwrap();
        assert_eq!(json, "\"web_socket\"");
    }

    #[test]
    fn manual_delay_reuses_last() {
        let p = ReconnectPolicy::new(
            vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(10), Duration::from_secs(30)],
            6,
        );
        assert_eq!(p.manual_delay(0), Duration::ZERO);
        assert_eq!(p.manual_delay(3), Duration::from_secs(30));
        assert_eq!(p.manual_delay(9), Duration::from_secs(30));
        assert_eq!(p.initial_schedule().len(), 6);
    }

    #[test]
    fn reconnect_schedule_runs_automatic_layer_first() {
        let p = ReconnectPolicy::from_config(&ReconnectConfig::default());
        let secs: Vec<u64> = p.reconnect_schedule().iter().map(|d| d.as_secs()).collect();
        assert_eq!(
            secs,
            vec![0, 1, 3, 5, 10, 0, 2, 10, 30, 30, 30, 30, 30, 30, 30]
        );
        let initial: Vec<u64> = p.initial_schedule().iter().map(|d| d.as_secs()).collect();
        assert_eq!(initial[..4], [0, 2, 10, 30]);
        assert_eq!(initial.len(), 10);
    }

    #[test]
    fn automatic_layer_can_be_disabled() {
        let cfg = ReconnectConfig {
            automatic_enabled: false,
            ..ReconnectConfig::default()
        };
        let p = ReconnectPolicy::from_config(&cfg);
        assert_eq!(p.reconnect_schedule(), p.initial_schedule());
    }
}
