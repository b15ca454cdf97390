use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::task::JoinHandle;
use uuid::Uuid;

use sl_bridge::dedup::{Deduplicator, PublishOutcome};
use sl_bridge::local_bus::{BusEvent, LocalBus, Subscription};
use sl_bridge::protocol::{CommandAck, Frame};
use sl_bridge::transport::{ConnectionState, Connector, ManagedConnection, ReconnectPolicy, TransportError};
use sl_core::config::{ConfigError, NodeConfig};
use sl_core::messages::Event;
use sl_core::{Envelope, BROADCAST};
use sl_telemetry::tracing_setup::{envelope_span, new_traceparent};

use crate::handlers::HandlerRegistry;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node.node_id is not configured")]
    MissingNodeId,
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("node agent is shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Must match the `nodeId` claim of the bearer token.
    pub node_id: Uuid,
    pub dedup_capacity: usize,
    pub dispatch_workers: usize,
}

impl NodeOptions {
    pub fn new(node_id: Uuid) -> Self {
        Self {
            node_id,
            dedup_capacity: sl_bridge::dedup::DEFAULT_CAPACITY,
            dispatch_workers: 2,
        }
    }

    pub fn from_config(cfg: &NodeConfig) -> Result<Self, NodeError> {
        Ok(Self {
            node_id: cfg.node_id.ok_or(NodeError::MissingNodeId)?,
            dedup_capacity: cfg.dedup_capacity,
            dispatch_workers: cfg.dispatch_workers,
        })
    }
}

/// Acks of recently handled commands, replayed when the hub redelivers one.
struct AckCache {
    inner: Mutex<LruCache<Uuid, CommandAck>>,
}

impl AckCache {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn put(&self, ack: CommandAck) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(ack.command_id, ack);
    }

    fn get(&self, id: &Uuid) -> Option<CommandAck> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }
}

/// The node end of the bridge, embedded in a game server.
///
/// Owns the managed connection to the hub and a local bus whose fan-out runs
/// on a small worker pool, so neither [`publish_event`](Self::publish_event)
/// nor inbound traffic ever runs handler code on the caller's thread.
///
/// Inbound commands pass the [`Deduplicator`] before reaching the handlers;
/// every handled command is acked to the hub. A redelivered command that was
/// already handled is not run again: its cached ack is re-sent instead.
pub struct NodeAgent {
    node_id: Uuid,
    bus: LocalBus,
    dedup: Arc<Deduplicator>,
    acks: Arc<AckCache>,
    handlers: Arc<HandlerRegistry>,
    connection: Arc<ManagedConnection>,
    ack_tx: flume::Sender<CommandAck>,
    ack_rx: flume::Receiver<CommandAck>,
    subscriptions: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl NodeAgent {
    pub fn new(
        options: NodeOptions,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        handlers: HandlerRegistry,
    ) -> Self {
        let bus = LocalBus::with_dispatch_pool(options.dispatch_workers);
        let dedup = Arc::new(Deduplicator::new(bus.clone(), options.dedup_capacity));
        let (ack_tx, ack_rx) = flume::unbounded();
        Self {
            node_id: options.node_id,
            bus,
            dedup,
            acks: Arc::new(AckCache::new(options.dedup_capacity)),
            handlers: Arc::new(handlers),
            connection: Arc::new(ManagedConnection::new(connector, policy)),
            ack_tx,
            ack_rx,
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// The node-local bus. Embedders subscribe here to observe events from
    /// the hub and from the node itself.
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.connection
            .wait_for_state(ConnectionState::Connected, timeout)
            .await
    }

    /// Wire the handler dispatch, the inbound and outbound pumps, and start
    /// connecting. Calling it again is a no-op. Must run inside a Tokio runtime.
    pub fn start(&self) -> Result<(), NodeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Frames arriving before the pumps below exist wait in the inbound queue.
        if let Err(e) = self.connection.connect() {
            self.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        let node_id = self.node_id;

        // Handlers run on one bus worker: one command at a time, in arrival order.
        let handlers = self.handlers.clone();
        let acks = self.acks.clone();
        let ack_tx = self.ack_tx.clone();
        let dispatch = self.bus.subscribe_fn(
            move |env| env.is_command() && env.is_addressed_to(node_id),
            move |event| {
                let BusEvent::Message(command) = event else {
                    return;
                };
                let span = envelope_span(command.trace_parent(), command.message_type());
                let _entered = span.enter();
                let ack = handlers.dispatch(&command);
                tracing::debug!(command_id = %command.id(), success = ack.success, "command handled");
                acks.put(ack.clone());
                let _ = ack_tx.send(ack);
            },
        );

        // Node-originated events go to the hub; they are never buffered.
        let (event_tx, event_rx) = flume::unbounded::<Envelope>();
        let outbound = self.bus.subscribe_fn(
            move |env| env.is_event() && env.origin_node_id() == node_id,
            move |event| {
                if let BusEvent::Message(env) = event {
                    let _ = event_tx.send(env);
                }
            },
        );
        {
            let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subs.push(dispatch);
            subs.push(outbound);
        }

        let tasks = vec![
            tokio::spawn(inbound_pump(
                node_id,
                self.connection.inbound(),
                self.dedup.clone(),
                self.acks.clone(),
                self.ack_tx.clone(),
            )),
            tokio::spawn(ack_pump(self.ack_rx.clone(), self.connection.clone())),
            tokio::spawn(event_pump(event_rx, self.connection.clone())),
        ];
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).extend(tasks);
        tracing::info!(%node_id, "node agent started");
        Ok(())
    }

    /// Publish a node event on the local bus; it is forwarded to the hub while
    /// connected and dropped otherwise. Addressed to every node.
    pub fn publish_event(&self, event: impl Into<Event>) -> Envelope {
        self.publish_event_to(BROADCAST, event)
    }

    pub fn publish_event_to(&self, target: Uuid, event: impl Into<Event>) -> Envelope {
        let event: Event = event.into();
        let envelope = Envelope::new(self.node_id, target, event).with_trace_parent(new_traceparent());
        self.bus.publish(envelope.clone());
        envelope
    }

    /// Send an event straight to the hub, bypassing the local bus. Meant for
    /// last words such as `ServerStopping` right before [`shutdown`](Self::shutdown).
    pub async fn send_event_now(&self, event: impl Into<Event>) -> Result<Envelope, NodeError> {
        let event: Event = event.into();
        let envelope = Envelope::new(self.node_id, BROADCAST, event).with_trace_parent(new_traceparent());
        self.connection.send(Frame::PublishEvent(envelope.clone())).await?;
        Ok(envelope)
    }

    /// Terminal and idempotent: disconnects, stops the pumps and shuts the
    /// local bus down.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.disconnect();
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.bus.shutdown();
        tracing::info!(node_id = %self.node_id, "node agent stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for NodeAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn inbound_pump(
    node_id: Uuid,
    inbound: flume::Receiver<Frame>,
    dedup: Arc<Deduplicator>,
    acks: Arc<AckCache>,
    ack_tx: flume::Sender<CommandAck>,
) {
    while let Ok(frame) = inbound.recv_async().await {
        let Frame::ReceiveEnvelope(env) = frame else {
            tracing::warn!(frame = frame.name(), "unexpected frame from hub dropped");
            continue;
        };
        if env.is_command() && !env.is_addressed_to(node_id) {
            tracing::warn!(command_id = %env.id(), target = %env.target_node_id(), "command for another node dropped");
            continue;
        }
        let id = env.id();
        let is_command = env.is_command();
        if dedup.publish(env) == PublishOutcome::Duplicate && is_command {
            match acks.get(&id) {
                Some(ack) => {
                    tracing::debug!(command_id = %id, "re-sending ack for redelivered command");
                    let _ = ack_tx.send(ack);
                }
                None => tracing::debug!(command_id = %id, "redelivered command still in progress"),
            }
        }
    }
}

async fn ack_pump(acks: flume::Receiver<CommandAck>, connection: Arc<ManagedConnection>) {
    while let Ok(ack) = acks.recv_async().await {
        let command_id = ack.command_id;
        if let Err(e) = connection.send(Frame::AcknowledgeCommand(ack)).await {
            // The hub redelivers unacked commands on reconnect; the cached ack
            // answers that redelivery.
            tracing::debug!(%command_id, error = %e, "ack not sent; awaiting redelivery");
        }
    }
}

async fn event_pump(events: flume::Receiver<Envelope>, connection: Arc<ManagedConnection>) {
    while let Ok(env) = events.recv_async().await {
        let envelope_id = env.id();
        if let Err(e) = connection.send(Frame::PublishEvent(env)).await {
            tracing::debug!(%envelope_id, error = %e, "event dropped while disconnected");
        }
    }
}
