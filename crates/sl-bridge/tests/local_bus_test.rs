use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sl_bridge::local_bus::{BusEvent, LocalBus};
use sl_core::messages::{Announce, ChatMessage, Command, KickPlayer, ServerHeartbeat};
use sl_core::{Envelope, BROADCAST};
use uuid::Uuid;

fn event() -> Envelope {
    Envelope::new(Uuid::new_v4(), BROADCAST, ServerHeartbeat::default())
}

fn command() -> Envelope {
    Envelope::build::<KickPlayer>(Uuid::new_v4(), Uuid::new_v4(), |k| {
        k.player_id = "p-1".into()
    })
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    let bus = LocalBus::new();
    let a = bus.subscribe(|_| true);
    let b = bus.subscribe(|_| true);

    let env = event();
    bus.publish(env.clone());

    assert_eq!(a.recv().await.unwrap().id(), env.id());
    assert_eq!(b.recv().await.unwrap().id(), env.id());
}

#[tokio::test]
async fn test_late_subscriber_sees_only_future_messages() {
    let bus = LocalBus::new();
    let early = bus.subscribe(|_| true);
    let first = event();
    bus.publish(first.clone());

    let late = bus.subscribe(|_| true);
    let second = event();
    bus.publish(second.clone());

    assert_eq!(early.recv().await.unwrap().id(), first.id());
    assert_eq!(early.recv().await.unwrap().id(), second.id());
    assert_eq!(late.recv().await.unwrap().id(), second.id());
    assert!(late.try_recv().is_none());
}

#[test]
fn test_filter_selects_messages() {
    let bus = LocalBus::new();
    let events = bus.subscribe(|e| e.is_event());
    let commands = bus.subscribe(|e| e.is_command());

    bus.publish(event());
    bus.publish(command());

    assert!(events.try_recv().unwrap().is_event());
    assert!(events.try_recv().is_none());
    assert!(commands.try_recv().unwrap().is_command());
    assert!(commands.try_recv().is_none());
}

#[test]
fn test_publish_with_no_subscribers_is_fine() {
    let bus = LocalBus::new();
    bus.publish(event());
    assert_eq!(bus.subscriber_count(), 0);
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[test]
fn test_release_is_idempotent() {
    let bus = LocalBus::new();
    let keep = bus.subscribe(|_| true);
    let sub = bus.subscribe(|_| true);
    assert_eq!(bus.subscriber_count(), 2);

    sub.release();
    sub.release();
    assert!(sub.is_released());
    assert_eq!(bus.subscriber_count(), 1);

    bus.publish(event());
    assert!(sub.try_recv().is_none());
    assert!(keep.try_recv().is_some());
}

#[test]
fn test_drop_releases_subscription() {
    let bus = LocalBus::new();
    {
        let _sub = bus.subscribe(|_| true);
        assert_eq!(bus.subscriber_count(), 1);
    }
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_release_after_bus_dropped() {
    let bus = LocalBus::new();
    let sub = bus.subscribe(|_| true);
    drop(bus);
    sub.release();
    assert!(sub.try_recv().is_none());
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_completes_channel_subscribers() {
    let bus = LocalBus::new();
    let sub = bus.subscribe(|_| true);

    bus.shutdown();
    bus.publish(event());

    assert!(bus.is_shut_down());
    let next = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("completion, not a hang");
    assert!(next.is_none());
}

#[test]
fn test_shutdown_signals_callbacks_and_stops_delivery() {
    let bus = LocalBus::new();
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let sink = log.clone();
    let _sub = bus.subscribe_fn(
        |_| true,
        move |ev| {
            let tag = match ev {
                BusEvent::Message(_) => "message",
                BusEvent::Completed => "completed",
            };
            sink.lock().unwrap().push(tag);
        },
    );

    bus.publish(event());
    bus.shutdown();
    bus.shutdown();
    bus.publish(event());

    assert_eq!(*log.lock().unwrap(), vec!["message", "completed"]);
}

#[test]
fn test_messages_before_shutdown_still_readable() {
    let bus = LocalBus::new();
    let sub = bus.subscribe(|_| true);
    let env = event();
    bus.publish(env.clone());
    bus.shutdown();

    assert_eq!(sub.try_recv().unwrap().id(), env.id());
    assert!(sub.try_recv().is_none());
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[test]
fn test_panicking_subscriber_does_not_affect_others() {
    let bus = LocalBus::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    let _bad = bus.subscribe_fn(|_| true, |_| panic!("subscriber exploded"));
    let counter = delivered.clone();
    let _good = bus.subscribe_fn(
        |_| true,
        move |ev| {
            if matches!(ev, BusEvent::Message(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        },
    );
    let chan = bus.subscribe(|_| true);

    bus.publish(event());
    bus.publish(event());

    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert!(chan.try_recv().is_some());
    assert!(chan.try_recv().is_some());
}

#[test]
fn test_panicking_filter_is_isolated() {
    let bus = LocalBus::new();
    let _bad = bus.subscribe(|_| panic!("filter exploded"));
    let good = bus.subscribe(|_| true);
    bus.publish(event());
    assert!(good.try_recv().is_some());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_publish_from_many_threads() {
    let bus = LocalBus::new();
    let sub = bus.subscribe(|_| true);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bus = bus.clone();
            std::thread::spawn(move || {
                for _ in 0..250 {
                    bus.publish(event());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut received = 0;
    while sub.try_recv().is_some() {
        received += 1;
    }
    assert_eq!(received, 2000);
}

#[test]
fn test_dispatch_pool_runs_subscribers_off_the_caller_thread() {
    let bus = LocalBus::with_dispatch_pool(2);
    let threads = Arc::new(Mutex::new(Vec::<String>::new()));
    let (done_tx, done_rx) = flume::unbounded();

    let seen = threads.clone();
    let _sub = bus.subscribe_fn(
        |e| e.is_event(),
        move |ev| {
            if let BusEvent::Message(_) = ev {
                // Slow subscriber: publish must not wait for it.
                std::thread::sleep(Duration::from_millis(20));
                let name = std::thread::current().name().unwrap_or("").to_string();
                seen.lock().unwrap().push(name);
                let _ = done_tx.send(());
            }
        },
    );

    let started = std::time::Instant::now();
    for _ in 0..5 {
        bus.publish(Envelope::new(Uuid::new_v4(), BROADCAST, ChatMessage::default()));
    }
    assert!(started.elapsed() < Duration::from_millis(100));

    for _ in 0..5 {
        done_rx.recv_timeout(Duration::from_secs(2)).expect("delivered");
    }
    let names = threads.lock().unwrap();
    assert_eq!(names.len(), 5);
    assert!(names.iter().all(|n| n.starts_with("bus-dispatch-")));
}

#[test]
fn test_dispatch_pool_shutdown_completes_subscribers() {
    let bus = LocalBus::with_dispatch_pool(1);
    let sub = bus.subscribe(|_| true);
    bus.shutdown();
    bus.publish(event());
    assert!(sub.recv_timeout(Duration::from_millis(500)).is_none());
}

#[test]
fn test_dispatch_pool_keeps_each_subscriber_in_publish_order() {
    let bus = LocalBus::with_dispatch_pool(2);
    let order = Arc::new(Mutex::new(Vec::<usize>::new()));
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = flume::unbounded();

    let seen = order.clone();
    let (running_in, overlapped_in) = (running.clone(), overlapped.clone());
    let _sub = bus.subscribe_fn(
        |e| e.is_command(),
        move |ev| {
            if let BusEvent::Message(env) = ev {
                if running_in.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped_in.fetch_add(1, Ordering::SeqCst);
                }
                let Some(Command::Announce(a)) = env.command() else {
                    panic!("unexpected {}", env.message_type());
                };
                let n: usize = a.message.parse().unwrap();
                if n % 2 == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                }
                seen.lock().unwrap().push(n);
                running_in.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            }
        },
    );

    let target = Uuid::new_v4();
    for n in 0..40 {
        bus.publish(Envelope::build::<Announce>(Uuid::new_v4(), target, |a| {
            a.message = n.to_string()
        }));
    }
    for _ in 0..40 {
        done_rx.recv_timeout(Duration::from_secs(2)).expect("delivered");
    }

    assert_eq!(*order.lock().unwrap(), (0..40).collect::<Vec<_>>());
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
}
