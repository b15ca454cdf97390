use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use sl_telemetry::metrics::{global_metrics, names};

use crate::local_bus::Subscription;
use crate::transport::ProxyTransport;

/// Snapshot of one node's registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: Uuid,
    pub online: bool,
    pub connection_id: Option<Uuid>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

struct LiveLink {
    connection_id: Uuid,
    transport: Arc<dyn ProxyTransport>,
    // Held for ownership only; released when the link is removed.
    _subscription: Subscription,
    connected_at: DateTime<Utc>,
}

struct NodeEntry {
    live: Option<LiveLink>,
    last_seen: DateTime<Utc>,
}

struct ObserverEntry {
    _subscription: Subscription,
}

#[derive(Default)]
struct Registry {
    nodes: AHashMap<Uuid, NodeEntry>,
    observers: AHashMap<Uuid, ObserverEntry>,
}

/// The hub's volatile registry of live node and observer connections.
///
/// Owns each connection's bus [`Subscription`]: removing an entry releases
/// it. All state sits behind one mutex; nothing here survives a restart.
#[derive(Default)]
pub struct ConnectionManager {
    registry: Mutex<Registry>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_gauges(reg: &Registry) {
        let online = reg.nodes.values().filter(|n| n.live.is_some()).count();
        global_metrics().set_gauge(names::NODES_ONLINE, online as i64);
        global_metrics().set_gauge(names::OBSERVERS_ONLINE, reg.observers.len() as i64);
    }

    /// Mark `node_id` online through a new connection, replacing any previous
    /// one. Returns the replaced transport so the caller can close it.
    pub fn register_node(
        &self,
        node_id: Uuid,
        connection_id: Uuid,
        transport: Arc<dyn ProxyTransport>,
        subscription: Subscription,
    ) -> Option<Arc<dyn ProxyTransport>> {
        let now = Utc::now();
        let previous = {
            let mut reg = self.lock();
            let entry = reg.nodes.entry(node_id).or_insert(NodeEntry {
                live: None,
                last_seen: now,
            });
            entry.last_seen = now;
            let previous = entry.live.replace(LiveLink {
                connection_id,
                transport,
                _subscription: subscription,
                connected_at: now,
            });
            Self::publish_gauges(&reg);
            previous
        };
        if previous.is_some() {
            tracing::warn!(%node_id, %connection_id, "node reconnected; replacing previous connection");
        }
        tracing::info!(%node_id, %connection_id, "node online");
        // Subscription of the replaced link is released here, outside the lock.
        previous.map(|link| link.transport)
    }

    /// Mark the node offline if `connection_id` is still its registered
    /// connection. Returns `false` when a newer connection has taken over.
    pub fn unregister_node(&self, node_id: Uuid, connection_id: Uuid) -> bool {
        let removed = {
            let mut reg = self.lock();
            let Some(entry) = reg.nodes.get_mut(&node_id) else {
                return false;
            };
            if entry.live.as_ref().map(|l| l.connection_id) != Some(connection_id) {
                return false;
            }
            entry.last_seen = Utc::now();
            let removed = entry.live.take();
            Self::publish_gauges(&reg);
            removed
        };
        tracing::info!(%node_id, %connection_id, "node offline");
        drop(removed);
        true
    }

    /// The live transport of `node_id` and the id of its connection.
    pub fn node_transport(&self, node_id: Uuid) -> Option<(Uuid, Arc<dyn ProxyTransport>)> {
        self.lock()
            .nodes
            .get(&node_id)
            .and_then(|e| e.live.as_ref())
            .map(|l| (l.connection_id, l.transport.clone()))
    }

    pub fn is_online(&self, node_id: Uuid) -> bool {
        self.lock()
            .nodes
            .get(&node_id)
            .is_some_and(|e| e.live.is_some())
    }

    /// Ids of every node with a live connection, sorted.
    pub fn online_nodes(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .lock()
            .nodes
            .iter()
            .filter(|(_, e)| e.live.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn node_statuses(&self) -> Vec<NodeStatus> {
        let mut out: Vec<NodeStatus> = self
            .lock()
            .nodes
            .iter()
            .map(|(id, e)| NodeStatus {
                node_id: *id,
                online: e.live.is_some(),
                connection_id: e.live.as_ref().map(|l| l.connection_id),
                connected_at: e.live.as_ref().map(|l| l.connected_at),
                last_seen: e.last_seen,
            })
            .collect();
        out.sort_by_key(|s| s.node_id);
        out
    }

    pub fn register_observer(&self, connection_id: Uuid, subscription: Subscription) {
        let mut reg = self.lock();
        reg.observers.insert(
            connection_id,
            ObserverEntry {
                _subscription: subscription,
            },
        );
        Self::publish_gauges(&reg);
        tracing::info!(%connection_id, "observer connected");
    }

    pub fn unregister_observer(&self, connection_id: Uuid) -> bool {
        let removed = {
            let mut reg = self.lock();
            let removed = reg.observers.remove(&connection_id);
            Self::publish_gauges(&reg);
            removed
        };
        if removed.is_some() {
            tracing::info!(%connection_id, "observer disconnected");
        }
        removed.is_some()
    }

    pub fn online_count(&self) -> usize {
        self.lock().nodes.values().filter(|e| e.live.is_some()).count()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_bus::LocalBus;
    use crate::transport::InProcessTransport;

    fn link(bus: &LocalBus) -> (Arc<dyn ProxyTransport>, Subscription) {
        let (a, _b) = InProcessTransport::pair();
        (Arc::new(a), bus.subscribe(|_| true))
    }

    #[test]
    fn register_and_unregister_node() {
        let bus = LocalBus::new();
        let mgr = ConnectionManager::new();
        let node = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (t, s) = link(&bus);

        assert!(mgr.register_node(node, conn, t, s).is_none());
        assert!(mgr.is_online(node));
        assert_eq!(mgr.online_nodes(), vec![node]);
        assert_eq!(bus.subscriber_count(), 1);

        assert!(mgr.unregister_node(node, conn));
        assert!(!mgr.is_online(node));
        assert_eq!(bus.subscriber_count(), 0);
        // Known but offline.
        let statuses = mgr.node_statuses();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].online);
        assert!(!mgr.unregister_node(node, conn));
    }

    #[test]
    fn stale_disconnect_does_not_evict_newer_connection() {
        let bus = LocalBus::new();
        let mgr = ConnectionManager::new();
        let node = Uuid::new_v4();
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());

        let (t1, s1) = link(&bus);
        mgr.register_node(node, old, t1, s1);
        let (t2, s2) = link(&bus);
        assert!(mgr.register_node(node, new, t2, s2).is_some());
        // Replaced link's subscription was released.
        assert_eq!(bus.subscriber_count(), 1);

        assert!(!mgr.unregister_node(node, old));
        assert!(mgr.is_online(node));
        assert_eq!(mgr.node_transport(node).map(|(id, _)| id), Some(new));
    }

    #[test]
    fn observers_are_tracked_by_connection() {
        let bus = LocalBus::new();
        let mgr = ConnectionManager::new();
        let conn = Uuid::new_v4();
        mgr.register_observer(conn, bus.subscribe(|e| e.is_event()));
        assert_eq!(mgr.observer_count(), 1);
        assert!(mgr.unregister_observer(conn));
        assert!(!mgr.unregister_observer(conn));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
