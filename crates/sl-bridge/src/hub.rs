use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use sl_core::outbox::{AckOutcome, OutboxEntry, OutboxStore};
use sl_core::Envelope;
use sl_telemetry::metrics::{global_metrics, names};
use sl_telemetry::tracing_setup::envelope_span;

use crate::auth::{AuthError, Claims, TokenValidator};
use crate::connections::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::local_bus::{BusEvent, LocalBus, Subscription};
use crate::protocol::{CommandAck, Frame};
use crate::transport::{self, Connector, InProcessTransport, ProxyTransport, TransportError};

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Interval of the `ping` frame written to every live connection.
    pub heartbeat: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// Which slice of the event stream an observer sees.
#[derive(Default)]
struct ObserverScope {
    /// `None` = every event.
    watched: RwLock<Option<AHashSet<Uuid>>>,
}

impl ObserverScope {
    fn allows(&self, env: &Envelope) -> bool {
        let watched = self.watched.read().unwrap_or_else(|e| e.into_inner());
        match watched.as_ref() {
            None => true,
            Some(set) => {
                env.is_broadcast()
                    || set.contains(&env.origin_node_id())
                    || set.contains(&env.target_node_id())
            }
        }
    }

    fn watch(&self, node_ids: Vec<Uuid>) {
        let mut watched = self.watched.write().unwrap_or_else(|e| e.into_inner());
        *watched = if node_ids.is_empty() {
            None
        } else {
            Some(node_ids.into_iter().collect())
        };
    }
}

/// The hub side of the bridge.
///
/// Accepts node connections (claim-checked, fed from the outbox) and
/// observer connections (event fan-out only), routes hub-bus traffic to them
/// and resolves outbox entries from node acks.
pub struct Hub {
    hub_id: Uuid,
    bus: LocalBus,
    outbox: OutboxStore,
    connections: ConnectionManager,
    validator: TokenValidator,
    options: HubOptions,
    drain_locks: Mutex<AHashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    command_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Build a hub over an outbox left by a previous hub process: entries it
    /// had sent but never saw acked go back to `Pending` before any node can
    /// connect, so the next drain redelivers them.
    pub async fn open(
        outbox: OutboxStore,
        validator: TokenValidator,
        options: HubOptions,
    ) -> Result<Arc<Self>> {
        outbox.revert_all_sent().await?;
        Ok(Self::new(outbox, validator, options))
    }

    /// Build a hub and start its command pump. Must be called from within a
    /// Tokio runtime. Does not touch `Sent` entries; see [`Hub::open`].
    pub fn new(outbox: OutboxStore, validator: TokenValidator, options: HubOptions) -> Arc<Self> {
        let hub = Arc::new(Self {
            hub_id: Uuid::new_v4(),
            bus: LocalBus::new(),
            outbox,
            connections: ConnectionManager::new(),
            validator,
            options,
            drain_locks: Mutex::new(AHashMap::new()),
            command_pump: Mutex::new(None),
        });
        let pump = tokio::spawn(command_pump(
            Arc::downgrade(&hub),
            hub.bus.subscribe(|env| env.is_command()),
        ));
        *hub.command_pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
        tracing::info!(hub_id = %hub.hub_id, "hub started");
        hub
    }

    /// Origin id stamped on hub-originated envelopes.
    pub fn hub_id(&self) -> Uuid {
        self.hub_id
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    // -- Authentication ------------------------------------------------------

    /// Validate a node handshake token and return the claimed node id.
    pub fn authenticate_node(&self, token: Option<&str>) -> std::result::Result<Uuid, AuthError> {
        self.validator.validate_opt(token)?.require_node_id()
    }

    pub fn authenticate_observer(&self, token: Option<&str>) -> std::result::Result<Claims, AuthError> {
        self.validator.validate_opt(token)
    }

    // -- Hub business logic entry points ------------------------------------

    /// Publish on the hub bus. Commands are picked up by the command pump
    /// and routed through the outbox; events fan out to observers and nodes.
    pub fn publish(&self, envelope: Envelope) {
        self.bus.publish(envelope);
    }

    /// Queue a command for its target node and deliver it if the node is
    /// online. A broadcast command is queued once per online node, each copy
    /// under its own id.
    pub async fn send_command(&self, command: Envelope) -> Result<Vec<OutboxEntry>> {
        if !command.is_command() {
            return Err(BridgeError::NotACommand(command.id()));
        }
        let targets: Vec<(Uuid, Envelope)> = if command.is_broadcast() {
            let online = self.connections.online_nodes();
            if online.is_empty() {
                tracing::warn!(
                    command_id = %command.id(),
                    message_type = command.message_type(),
                    "broadcast command with no node online; nothing queued"
                );
            }
            online.into_iter().map(|n| (n, command.fork_for(n))).collect()
        } else {
            vec![(command.target_node_id(), command)]
        };

        let mut entries = Vec::with_capacity(targets.len());
        for (node_id, env) in targets {
            let entry = self.outbox.enqueue(&env, node_id).await?;
            tracing::info!(
                command_id = %entry.id,
                %node_id,
                message_type = %entry.message_type,
                "command queued"
            );
            entries.push(entry);
            if self.connections.is_online(node_id) {
                self.drain(node_id).await?;
            }
        }
        Ok(entries)
    }

    /// Push every pending command of `node_id` over its live connection,
    /// oldest first. Each entry is claimed (`Pending` → `Sent`) before it is
    /// written; a failed write returns it to `Pending` and stops the drain.
    pub async fn drain(&self, node_id: Uuid) -> Result<usize> {
        let lock = {
            let mut locks = self.drain_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(node_id).or_default().clone()
        };
        let _serialised = lock.lock().await;

        let Some((connection_id, transport)) = self.connections.node_transport(node_id) else {
            return Ok(0);
        };
        let started = Instant::now();
        let mut delivered = 0;
        for entry in self.outbox.pending_for(node_id).await? {
            let envelope = match entry.envelope() {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(command_id = %entry.id, error = %e, "stored command undecodable; skipping");
                    continue;
                }
            };
            if !self.outbox.claim(entry.id).await? {
                continue;
            }
            if let Err(e) = transport.send(Frame::ReceiveEnvelope(envelope)).await {
                self.outbox.release_claim(entry.id).await?;
                tracing::warn!(%node_id, %connection_id, command_id = %entry.id, error = %e, "delivery failed; command back to pending");
                break;
            }
            global_metrics().increment_counter(names::ENVELOPES_TOTAL, &[("direction", "outbound")]);
            tracing::debug!(%node_id, command_id = %entry.id, "command delivered");
            delivered += 1;
        }
        global_metrics().record_histogram(names::DRAIN_DURATION_SECONDS, started.elapsed().as_secs_f64());
        if delivered > 0 {
            tracing::info!(%node_id, delivered, "outbox drained");
        }
        Ok(delivered)
    }

    /// Fail every non-terminal outbox entry older than `max_age`.
    pub async fn sweep_expired(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        Ok(self.outbox.expire_older_than(max_age).await?)
    }

    // -- Inbound frames ------------------------------------------------------

    /// Apply one frame received on `node_id`'s connection.
    pub async fn handle_node_frame(&self, node_id: Uuid, frame: Frame) -> Result<()> {
        match frame {
            Frame::PublishEvent(env) => self.accept_event(node_id, env),
            Frame::AcknowledgeCommand(ack) => self.acknowledge(node_id, ack).await.map(|_| ()),
            Frame::Ping(_) => Ok(()),
            other => Err(BridgeError::UnexpectedFrame(other.name())),
        }
    }

    fn accept_event(&self, node_id: Uuid, env: Envelope) -> Result<()> {
        if !env.is_event() {
            return Err(BridgeError::NotAnEvent(env.id()));
        }
        if env.origin_node_id() != node_id {
            global_metrics().increment_counter(names::CLAIM_REJECTIONS_TOTAL, &[]);
            return Err(BridgeError::OriginMismatch {
                claimed: node_id,
                origin: env.origin_node_id(),
            });
        }
        global_metrics().increment_counter(names::ENVELOPES_TOTAL, &[("direction", "inbound")]);
        let span = envelope_span(env.trace_parent(), env.message_type());
        let _entered = span.enter();
        tracing::debug!(%node_id, envelope_id = %env.id(), "event accepted");
        self.bus.publish(env);
        Ok(())
    }

    /// Resolve an outbox entry from `node_id`'s ack.
    ///
    /// Unknown ids and entries that are not `Sent` are ignored. An ack for
    /// another node's command is rejected.
    pub async fn acknowledge(&self, node_id: Uuid, ack: CommandAck) -> Result<AckOutcome> {
        let Some(entry) = self.outbox.get(ack.command_id).await? else {
            tracing::debug!(%node_id, command_id = %ack.command_id, "ack for unknown command ignored");
            global_metrics().increment_counter(names::OUTBOX_ACKS_TOTAL, &[("outcome", AckOutcome::Ignored.as_str())]);
            return Ok(AckOutcome::Ignored);
        };
        if entry.node_id != node_id {
            return Err(BridgeError::ForeignAck {
                node_id,
                command_id: ack.command_id,
            });
        }
        let outcome = self
            .outbox
            .acknowledge(ack.command_id, ack.success, ack.response_payload, ack.error_message)
            .await?;
        global_metrics().increment_counter(names::OUTBOX_ACKS_TOTAL, &[("outcome", outcome.as_str())]);
        match outcome {
            AckOutcome::Failed => {
                tracing::warn!(%node_id, command_id = %ack.command_id, "node reported command failure")
            }
            AckOutcome::Ignored => {
                tracing::debug!(%node_id, command_id = %ack.command_id, status = %entry.status, "ack ignored")
            }
            AckOutcome::Completed => {
                tracing::debug!(%node_id, command_id = %ack.command_id, "command completed")
            }
        }
        Ok(outcome)
    }

    // -- Sessions -----------------------------------------------------------

    /// Run a node connection until its transport closes.
    ///
    /// `node_id` must come from a verified claim. On connect the node is
    /// marked online and drained; on disconnect it is marked offline and its
    /// unacknowledged commands return to `Pending`.
    pub async fn serve_node(self: Arc<Self>, node_id: Uuid, transport: Box<dyn ProxyTransport>) {
        let transport: Arc<dyn ProxyTransport> = Arc::from(transport);
        let connection_id = Uuid::new_v4();
        let span = tracing::info_span!("node_session", %node_id, %connection_id);

        async move {
            let (out_tx, out_rx) = flume::unbounded();
            let subscription = self.bus.subscribe_fn(
                move |env| {
                    env.is_event() && env.is_addressed_to(node_id) && env.origin_node_id() != node_id
                },
                forward_to(out_tx),
            );
            if let Some(replaced) =
                self.connections
                    .register_node(node_id, connection_id, transport.clone(), subscription)
            {
                tokio::spawn(async move { replaced.close().await });
            }
            let writer = spawn_writer(transport.clone(), out_rx, self.options.heartbeat);

            if let Err(e) = self.drain(node_id).await {
                tracing::error!(error = %e, "initial drain failed");
            }

            loop {
                match transport.recv().await {
                    Ok(frame) => {
                        if let Err(e) = self.handle_node_frame(node_id, frame).await {
                            if e.is_validation() {
                                global_metrics().increment_counter(names::INVALID_FRAMES_TOTAL, &[]);
                                tracing::warn!(error = %e, "frame rejected");
                            } else {
                                tracing::error!(error = %e, "frame handling failed");
                            }
                        }
                    }
                    Err(TransportError::Serialization(e)) => {
                        global_metrics().increment_counter(names::INVALID_FRAMES_TOTAL, &[]);
                        tracing::warn!(error = %e, "malformed frame dropped");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "node transport closed");
                        break;
                    }
                }
            }

            writer.abort();
            self.on_node_disconnected(node_id, connection_id).await;
        }
        .instrument(span)
        .await
    }

    async fn on_node_disconnected(&self, node_id: Uuid, connection_id: Uuid) {
        self.connections.unregister_node(node_id, connection_id);
        match self.outbox.revert_sent(node_id).await {
            Ok(0) => {}
            // The node may already be back (a replacing session, or a reconnect
            // that drained before the revert landed); give it the reverted commands.
            Ok(_) if self.connections.is_online(node_id) => {
                if let Err(e) = self.drain(node_id).await {
                    tracing::error!(error = %e, "redrain after disconnect failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "failed to revert sent commands"),
        }
    }

    /// Run an observer connection until its transport closes. Observers only
    /// ever receive events.
    pub async fn serve_observer(self: Arc<Self>, claims: Claims, transport: Box<dyn ProxyTransport>) {
        let transport: Arc<dyn ProxyTransport> = Arc::from(transport);
        let connection_id = Uuid::new_v4();
        let span = tracing::info_span!("observer_session", %connection_id, sub = %claims.sub);

        async move {
            let scope = Arc::new(ObserverScope::default());
            let filter_scope = scope.clone();
            let (out_tx, out_rx) = flume::unbounded();
            let subscription = self.bus.subscribe_fn(
                move |env| env.is_event() && filter_scope.allows(env),
                forward_to(out_tx),
            );
            self.connections.register_observer(connection_id, subscription);
            let writer = spawn_writer(transport.clone(), out_rx, self.options.heartbeat);

            loop {
                match transport.recv().await {
                    Ok(Frame::WatchNodes(w)) => {
                        tracing::debug!(nodes = w.node_ids.len(), "observer scope changed");
                        scope.watch(w.node_ids);
                    }
                    Ok(Frame::Ping(_)) => {}
                    Ok(other) => {
                        global_metrics().increment_counter(names::INVALID_FRAMES_TOTAL, &[]);
                        tracing::warn!(frame = other.name(), "unexpected frame from observer dropped");
                    }
                    Err(TransportError::Serialization(e)) => {
                        global_metrics().increment_counter(names::INVALID_FRAMES_TOTAL, &[]);
                        tracing::warn!(error = %e, "malformed frame dropped");
                    }
                    Err(_) => break,
                }
            }

            writer.abort();
            self.connections.unregister_observer(connection_id);
        }
        .instrument(span)
        .await
    }

    /// Terminal: stops the command pump and shuts the hub bus down.
    pub fn shutdown(&self) {
        if let Some(pump) = self.command_pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.bus.shutdown();
        tracing::info!(hub_id = %self.hub_id, "hub shut down");
    }
}

/// Bus callback that queues matching envelopes for a connection's writer.
fn forward_to(out: flume::Sender<Frame>) -> impl Fn(BusEvent) + Send + Sync + 'static {
    move |event| {
        if let BusEvent::Message(env) = event {
            let _ = out.send(Frame::ReceiveEnvelope(env));
        }
    }
}

/// Single writer per connection: queued frames plus the heartbeat ping.
fn spawn_writer(
    transport: Arc<dyn ProxyTransport>,
    frames: flume::Receiver<Frame>,
    heartbeat: Duration,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(heartbeat.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    frame = frames.recv_async() => {
                        let Ok(frame) = frame else { break };
                        if transport.send(frame).await.is_err() {
                            break;
                        }
                        global_metrics().increment_counter(names::ENVELOPES_TOTAL, &[("direction", "outbound")]);
                    }
                    _ = ticker.tick() => {
                        if transport.send(Frame::ping()).await.is_err() {
                            tracing::debug!("heartbeat ping failed, connection lost");
                            break;
                        }
                    }
                }
            }
        }
        .in_current_span(),
    )
}

async fn command_pump(hub: Weak<Hub>, commands: Subscription) {
    while let Some(command) = commands.recv().await {
        let Some(hub) = hub.upgrade() else { break };
        let span = envelope_span(command.trace_parent(), command.message_type());
        if let Err(e) = hub.send_command(command).instrument(span).await {
            tracing::error!(error = %e, "failed to route command");
        }
    }
    tracing::debug!("command pump stopped");
}

// ---------------------------------------------------------------------------
// In-process connector
// ---------------------------------------------------------------------------

/// Connects to a [`Hub`] in the same process over an in-process transport
/// pair, authenticating with a node token exactly like the websocket path.
pub struct InProcessConnector {
    hub: Arc<Hub>,
    token: String,
}

impl InProcessConnector {
    pub fn new(hub: Arc<Hub>, token: impl Into<String>) -> Self {
        Self {
            hub,
            token: token.into(),
        }
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self) -> transport::Result<Box<dyn ProxyTransport>> {
        let node_id = self
            .hub
            .authenticate_node(Some(self.token.as_str()))
            .map_err(|_| TransportError::Unauthorized)?;
        let (hub_side, node_side) = InProcessTransport::pair();
        tokio::spawn(self.hub.clone().serve_node(node_id, Box::new(hub_side)));
        Ok(Box::new(node_side))
    }

    fn describe(&self) -> String {
        "in-process hub".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_core::messages::{ChatMessage, ServerHeartbeat};
    use sl_core::BROADCAST;

    #[test]
    fn observer_scope_filters_by_origin_or_target() {
        let scope = ObserverScope::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let from_a = Envelope::new(a, b, ChatMessage::default());
        let from_b = Envelope::new(b, Uuid::new_v4(), ChatMessage::default());
        let broadcast = Envelope::new(b, BROADCAST, ServerHeartbeat::default());

        assert!(scope.allows(&from_b));
        scope.watch(vec![a]);
        assert!(scope.allows(&from_a));
        assert!(!scope.allows(&from_b));
        assert!(scope.allows(&broadcast));
        scope.watch(vec![]);
        assert!(scope.allows(&from_b));
    }
}
