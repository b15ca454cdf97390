use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use sl_core::Envelope;
use sl_telemetry::metrics::{global_metrics, names};

/// What a callback subscriber receives.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Message(Envelope),
    /// The bus was shut down; no further messages follow.
    Completed,
}

type Filter = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;
type Callback = Box<dyn Fn(BusEvent) + Send + Sync>;

enum Sink {
    Channel(flume::Sender<Envelope>),
    Callback(Callback),
}

struct Subscriber {
    id: u64,
    filter: Filter,
    sink: Sink,
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        match &self.sink {
            Sink::Channel(tx) => tx.is_disconnected(),
            Sink::Callback(_) => false,
        }
    }

    /// Deliver one envelope. Filter and callback panics stay inside this call.
    fn deliver(&self, envelope: &Envelope) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            if !(self.filter)(envelope) {
                return;
            }
            match &self.sink {
                // A send error means the receiver was dropped; pruned on the next publish.
                Sink::Channel(tx) => {
                    let _ = tx.send(envelope.clone());
                }
                Sink::Callback(cb) => cb(BusEvent::Message(envelope.clone())),
            }
        }));
        if let Err(panic) = result {
            global_metrics().increment_counter(names::HANDLER_FAILURES_TOTAL, &[("stage", "bus")]);
            tracing::error!(
                subscriber = self.id,
                envelope_id = %envelope.id(),
                message_type = envelope.message_type(),
                panic = %panic_message(&*panic),
                "bus subscriber panicked; other subscribers unaffected"
            );
        }
    }

    fn complete(&self) {
        if let Sink::Callback(cb) = &self.sink {
            if catch_unwind(AssertUnwindSafe(|| cb(BusEvent::Completed))).is_err() {
                tracing::error!(subscriber = self.id, "bus subscriber panicked on completion");
            }
        }
    }
}

/// Extract a readable message from a `catch_unwind` payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

type Job = (Arc<Subscriber>, Envelope);

/// Worker queues of a dispatch pool. A subscriber is pinned to one worker,
/// so it sees messages in publish order and never runs twice at once.
#[derive(Clone)]
struct Pool {
    workers: Vec<flume::Sender<Job>>,
}

impl Pool {
    fn dispatch(&self, subscribers: Vec<Arc<Subscriber>>, envelope: &Envelope) {
        for sub in subscribers {
            let worker = &self.workers[sub.id as usize % self.workers.len()];
            if let Err(flume::SendError((sub, envelope))) = worker.send((sub, envelope.clone())) {
                sub.deliver(&envelope);
            }
        }
    }
}

struct State {
    subscribers: Vec<Arc<Subscriber>>,
    shut_down: bool,
    pool: Option<Pool>,
}

struct Shared {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) {
        let removed: Vec<Arc<Subscriber>> = {
            let mut state = self.lock();
            let (gone, kept) = std::mem::take(&mut state.subscribers)
                .into_iter()
                .partition(|s| s.id == id);
            state.subscribers = kept;
            gone
        };
        // Dropped outside the lock: a channel subscriber's sender goes away here.
        drop(removed);
    }
}

/// In-process broadcast of [`Envelope`]s.
///
/// Every `publish` reaches the subscribers registered at the moment of the
/// call; subscribers added later only see later messages. The bus is cheap to
/// clone and safe to publish into from any number of threads.
///
/// With [`LocalBus::with_dispatch_pool`] fan-out runs on dedicated worker
/// threads, so `publish` never executes subscriber code on the caller's
/// thread. Each subscriber still receives messages one at a time, in the
/// order they were published from any one thread.
#[derive(Clone)]
pub struct LocalBus {
    shared: Arc<Shared>,
}

impl LocalBus {
    /// A bus that delivers on the publishing thread.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    subscribers: Vec::new(),
                    shut_down: false,
                    pool: None,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A bus whose fan-out runs on `workers` background threads.
    ///
    /// Subscribers are spread across the workers; different subscribers run
    /// in parallel while each one stays serial. Falls back to inline delivery
    /// if no worker thread could be spawned.
    pub fn with_dispatch_pool(workers: usize) -> Self {
        let bus = Self::new();
        let mut senders = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let (tx, rx) = flume::unbounded::<Job>();
            let spawn = std::thread::Builder::new()
                .name(format!("bus-dispatch-{i}"))
                .spawn(move || {
                    while let Ok((sub, envelope)) = rx.recv() {
                        sub.deliver(&envelope);
                    }
                });
            match spawn {
                Ok(_) => senders.push(tx),
                Err(e) => tracing::warn!(error = %e, "failed to spawn bus dispatch worker"),
            }
        }
        if !senders.is_empty() {
            bus.shared.lock().pool = Some(Pool { workers: senders });
        }
        bus
    }

    /// Register a channel-backed subscriber for envelopes matching `filter`.
    pub fn subscribe<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = flume::unbounded();
        self.register(Box::new(filter), Sink::Channel(tx), Some(rx))
    }

    /// Register a callback subscriber. The callback runs on whichever thread
    /// performs delivery and must not block for long.
    pub fn subscribe_fn<F, C>(&self, filter: F, callback: C) -> Subscription
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
        C: Fn(BusEvent) + Send + Sync + 'static,
    {
        self.register(Box::new(filter), Sink::Callback(Box::new(callback)), None)
    }

    fn register(
        &self,
        filter: Filter,
        sink: Sink,
        receiver: Option<flume::Receiver<Envelope>>,
    ) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber { id, filter, sink });
        let mut state = self.shared.lock();
        if state.shut_down {
            drop(state);
            // Already terminal: the subscriber sees completion straight away.
            subscriber.complete();
            return Subscription::detached(id, receiver);
        }
        state.subscribers.push(subscriber);
        Subscription {
            id,
            bus: Arc::downgrade(&self.shared),
            receiver,
            released: AtomicBool::new(false),
        }
    }

    /// Deliver `envelope` to every current subscriber whose filter accepts it.
    ///
    /// A no-op after [`LocalBus::shutdown`]. Never propagates subscriber failures.
    pub fn publish(&self, envelope: Envelope) {
        let (snapshot, pool) = {
            let mut state = self.shared.lock();
            if state.shut_down {
                tracing::trace!(envelope_id = %envelope.id(), "publish after shutdown ignored");
                return;
            }
            state.subscribers.retain(|s| !s.is_closed());
            (state.subscribers.clone(), state.pool.clone())
        };
        if snapshot.is_empty() {
            return;
        }
        match pool {
            Some(pool) => pool.dispatch(snapshot, &envelope),
            None => {
                for sub in &snapshot {
                    sub.deliver(&envelope);
                }
            }
        }
    }

    /// Terminal. Later publishes are ignored; channel subscribers see their
    /// receiver complete and callback subscribers get [`BusEvent::Completed`].
    pub fn shutdown(&self) {
        let (subscribers, pool) = {
            let mut state = self.shared.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            (std::mem::take(&mut state.subscribers), state.pool.take())
        };
        // Workers finish what was published before shutdown, then exit.
        drop(pool);
        for sub in &subscribers {
            sub.complete();
        }
        tracing::debug!(subscribers = subscribers.len(), "local bus shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }

    /// Live subscribers, excluding channel subscribers whose receiver is gone.
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .lock()
            .subscribers
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one bus subscription. Releasing (or dropping) it detaches the
/// subscriber; releasing twice is a no-op.
pub struct Subscription {
    id: u64,
    bus: Weak<Shared>,
    receiver: Option<flume::Receiver<Envelope>>,
    released: AtomicBool,
}

impl Subscription {
    fn detached(id: u64, receiver: Option<flume::Receiver<Envelope>>) -> Self {
        Self {
            id,
            bus: Weak::new(),
            receiver,
            released: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next envelope, or `None` once the subscription is released or the bus
    /// shut down and everything already delivered has been read.
    ///
    /// Always `None` for callback subscriptions.
    pub async fn recv(&self) -> Option<Envelope> {
        self.receiver.as_ref()?.recv_async().await.ok()
    }

    /// Blocking variant of [`Subscription::recv`] with a timeout.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Envelope> {
        self.receiver.as_ref()?.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.receiver.as_ref()?.try_recv().ok()
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.bus.upgrade() {
            shared.remove(self.id);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}
