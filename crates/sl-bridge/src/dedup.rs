use std::collections::VecDeque;
use std::sync::Mutex;

use ahash::AHashSet;
use uuid::Uuid;

use sl_core::Envelope;
use sl_telemetry::metrics::{global_metrics, names};

use crate::local_bus::LocalBus;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Forwarded,
    /// Command id already tracked; nothing was published.
    Duplicate,
}

/// Bounded FIFO of seen command ids with O(1) membership.
struct SeenIds {
    order: VecDeque<Uuid>,
    members: AHashSet<Uuid>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: AHashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. Returns `false` if it was already tracked.
    fn insert(&mut self, id: Uuid) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.members.insert(id);
        true
    }
}

/// Node-side wrapper over a [`LocalBus`] that lets each command id through
/// at most once while it is remembered.
///
/// Events are forwarded untouched. For commands the membership check and the
/// insert happen under one lock, before forwarding, so two racing publishes
/// of the same id cannot both get through.
pub struct Deduplicator {
    bus: LocalBus,
    seen: Mutex<SeenIds>,
}

impl Deduplicator {
    pub fn new(bus: LocalBus, capacity: usize) -> Self {
        Self {
            bus,
            seen: Mutex::new(SeenIds::new(capacity.max(1))),
        }
    }

    pub fn publish(&self, envelope: Envelope) -> PublishOutcome {
        if envelope.is_command() && !self.record(envelope.id()) {
            global_metrics().increment_counter(names::DUPLICATES_DROPPED_TOTAL, &[]);
            tracing::info!(
                command_id = %envelope.id(),
                message_type = envelope.message_type(),
                "duplicate command dropped"
            );
            return PublishOutcome::Duplicate;
        }
        self.bus.publish(envelope);
        PublishOutcome::Forwarded
    }

    /// Atomically check-and-record a command id. `true` if it was new.
    pub fn record(&self, id: Uuid) -> bool {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).insert(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .members
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).capacity
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_eviction_order() {
        let mut seen = SeenIds::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(seen.insert(a));
        assert!(seen.insert(b));
        assert!(!seen.insert(a));
        // Re-seeing `a` does not refresh it; it is still the oldest.
        assert!(seen.insert(c));
        assert!(!seen.members.contains(&a));
        assert!(seen.members.contains(&b));
        assert_eq!(seen.order.len(), seen.members.len());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let d = Deduplicator::new(LocalBus::new(), 0);
        assert_eq!(d.capacity(), 1);
        assert!(d.record(Uuid::new_v4()));
    }
}
