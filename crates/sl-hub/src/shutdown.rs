use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// One-shot shutdown broadcast shared by the hub's server task, its sweeper
/// and the ctrl-c handler.
///
/// Tasks either `select!` on [`subscribe`](Self::subscribe) or await
/// [`triggered`](Self::triggered); the latter also returns immediately when
/// the signal fired before the call. Each task holds a [`DrainGuard`] so the
/// daemon can wait for them with [`wait_for_drain`](Self::wait_for_drain).
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drained_tx: Arc<watch::Sender<usize>>,
    drained_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drained_tx: Arc::new(drained_tx),
            drained_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Fire the signal. Later calls are no-ops.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolves once the signal has fired, including before this call.
    pub async fn triggered(&self) {
        // Subscribe before checking the flag so a concurrent trigger is not missed.
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub fn guard(&self) -> DrainGuard {
        DrainGuard {
            signal: self.clone(),
        }
    }

    fn confirm_drained(&self) {
        self.drained_tx.send_modify(|count| *count += 1);
    }

    /// Wait until `expected` guards have been dropped or `timeout` passes.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *self.drained_rx.borrow();
            if current >= expected {
                return DrainResult::Complete(current);
            }
            match tokio::time::timeout_at(deadline, self.drained_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete(*self.drained_rx.borrow()),
                Err(_) => {
                    let confirmed = *self.drained_rx.borrow();
                    warn!(confirmed, expected, "drain timed out");
                    return DrainResult::Timeout { confirmed, expected };
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.trigger.receiver_count()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Confirms drain when dropped.
#[derive(Debug)]
pub struct DrainGuard {
    signal: ShutdownSignal,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent_and_shared_by_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn subscriber_is_woken() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        assert_eq!(signal.subscriber_count(), 1);
        signal.trigger();
        let woke = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(woke.is_ok());
    }

    #[tokio::test]
    async fn triggered_returns_after_the_fact() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("already triggered");
    }

    #[tokio::test]
    async fn triggered_waits_for_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let mut signal = ShutdownSignal::new();
        let a = signal.guard();
        let b = signal.guard();
        signal.trigger();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(a);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(b);
        });
        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn drain_times_out_with_a_live_guard() {
        let mut signal = ShutdownSignal::new();
        let _held = signal.guard();
        drop(signal.guard());
        let result = signal.wait_for_drain(2, Duration::from_millis(50)).await;
        assert_eq!(result, DrainResult::Timeout { confirmed: 1, expected: 2 });
        assert!(!result.is_complete());
    }
}
