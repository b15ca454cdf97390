//! Hub daemon lifecycle: on-disk outbox, live listener, sweeper, shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sl_bridge::auth::{Claims, TokenValidator};
use sl_core::config::Config;
use sl_core::messages::KickPlayer;
use sl_core::outbox::{OutboxStatus, OutboxStore};
use sl_core::Envelope;
use sl_hub::daemon::check_config;
use sl_hub::HubDaemon;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

const SECRET: &str = "daemon-test-secret";

static NEXT_VAR: AtomicUsize = AtomicUsize::new(0);

/// A config whose outbox lives in `dir` and whose secret sits in a variable
/// private to the calling test.
fn test_config(dir: &tempfile::TempDir) -> Config {
    let var = format!(
        "SL_HUB_TEST_SECRET_{}_{}",
        std::process::id(),
        NEXT_VAR.fetch_add(1, Ordering::SeqCst)
    );
    std::env::set_var(&var, SECRET);

    let mut config = Config::default();
    config.hub.database_path = dir.path().join("data/outbox.db").display().to_string();
    config.auth.secret_env = var;
    config
}

async fn spawn_daemon(config: Config) -> (Arc<HubDaemon>, String, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let daemon = Arc::new(HubDaemon::new(config).await.unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.run_with_listener(listener).await })
    };
    (daemon, addr, handle)
}

async fn http_get(addr: &str, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn kick_for(node: Uuid) -> Envelope {
    Envelope::build::<KickPlayer>(Uuid::new_v4(), node, |k| k.player_id = "p-9".into())
}

#[tokio::test]
async fn test_daemon_serves_health_and_stops_on_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, addr, handle) = spawn_daemon(test_config(&dir)).await;

    let response = http_get(&addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(&daemon.hub().hub_id().to_string()));

    daemon.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("daemon stopped in time")
        .unwrap();
    assert!(result.is_ok());
    assert!(daemon.hub().bus().is_shut_down());
    assert!(tokio::net::TcpStream::connect(&addr).await.is_err());
}

#[tokio::test]
async fn test_daemon_stops_with_a_node_still_connected() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, addr, handle) = spawn_daemon(test_config(&dir)).await;

    let node = Uuid::new_v4();
    let token = TokenValidator::new(SECRET.as_bytes(), 0)
        .sign(&Claims::node("node", node, chrono::Duration::hours(1)))
        .unwrap();
    let url = format!("ws://{addr}/hub/node?access_token={token}");
    let (_socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while !daemon.hub().connections().is_online(node) {
        assert!(Instant::now() < deadline, "node never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    daemon.shutdown_handle().trigger();
    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("daemon stopped in time")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_outbox_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let node = Uuid::new_v4();
    let cmd = kick_for(node);

    {
        let daemon = HubDaemon::new(config.clone()).await.unwrap();
        let entries = daemon.hub().send_command(cmd.clone()).await.unwrap();
        assert_eq!(entries.len(), 1);
        daemon.hub().shutdown();
    }

    let reopened = OutboxStore::open(dir.path().join("data/outbox.db")).await.unwrap();
    let pending = reopened.pending_for(node).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, cmd.id());
    assert_eq!(pending[0].envelope().unwrap().command(), cmd.command());
}

#[tokio::test]
async fn test_commands_in_flight_at_exit_are_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let node = Uuid::new_v4();
    let cmd = kick_for(node);

    // A previous run sent the command and exited before the node acked.
    {
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        let outbox = OutboxStore::open(dir.path().join("data/outbox.db")).await.unwrap();
        outbox.enqueue(&cmd, node).await.unwrap();
        assert!(outbox.claim(cmd.id()).await.unwrap());
    }

    let (daemon, addr, handle) = spawn_daemon(config).await;
    let entry = daemon.hub().outbox().get(cmd.id()).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert!(entry.sent_at.is_none());

    let token = TokenValidator::new(SECRET.as_bytes(), 0)
        .sign(&Claims::node("node", node, chrono::Duration::hours(1)))
        .unwrap();
    let url = format!("ws://{addr}/hub/node?access_token={token}");
    let (_socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let entry = daemon.hub().outbox().get(cmd.id()).await.unwrap().unwrap();
        if entry.status == OutboxStatus::Sent {
            break;
        }
        assert!(Instant::now() < deadline, "command never redelivered: {}", entry.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_sweeper_expires_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.hub.outbox_max_age_secs = 0;
    config.hub.sweep_interval_secs = 1;
    let (daemon, _addr, handle) = spawn_daemon(config).await;

    let cmd = kick_for(Uuid::new_v4());
    daemon.hub().send_command(cmd.clone()).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let entry = daemon.hub().outbox().get(cmd.id()).await.unwrap().unwrap();
        if entry.status == OutboxStatus::Failed {
            assert_eq!(entry.error_message.as_deref(), Some("expired"));
            break;
        }
        assert!(Instant::now() < deadline, "entry never expired: {}", entry.status);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_missing_secret_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.auth.secret_env = "SL_HUB_TEST_SECRET_NEVER_SET".into();

    let err = HubDaemon::new(config.clone()).await.err().expect("must fail");
    assert!(err.to_string().contains("token secret"));

    let err = check_config(&config).unwrap_err();
    assert!(format!("{err:#}").contains("SL_HUB_TEST_SECRET_NEVER_SET"));
}

#[test]
fn test_check_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.hub.port = 7555;
    assert_eq!(check_config(&config).unwrap(), "127.0.0.1:7555");

    config.hub.sweep_interval_secs = 0;
    let err = check_config(&config).unwrap_err();
    assert!(format!("{err:#}").contains("sweep_interval_secs"));
}
