//! End-to-end scenarios, one `#[tokio::test]` per behavior, following the
//! teacher's `tests/integration.rs` convention of exercising the public
//! surface (`listen`/`connect`) rather than internals.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use juggler::config::{ClientConfig, ServerConfig};
use juggler::connection::{Connection, ConnectionHandler};
use juggler::error::JugglerError;
use juggler::session::{NotifyHandler, RequestHandler};
use juggler::{client, server};

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

async fn connect_client(
    addr: std::net::SocketAddr,
    notify_handler: Option<NotifyHandler>,
) -> Connection {
    let config = ClientConfig::new(format!("ws://{addr}/ws"));
    client::connect(config, notify_handler).await.unwrap()
}

#[tokio::test]
async fn connect_notify_round_trip() {
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<(String, Value)>();
    let notify_handler: NotifyHandler = Arc::new(move |name, data| {
        let _ = notify_tx.send((name, data));
    });

    let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
    let connections_for_cb = connections.clone();
    let connection_handler: ConnectionHandler = Arc::new(move |conn| {
        connections_for_cb.lock().unwrap().push(conn);
    });

    let cfg = ServerConfig::new(localhost(), 0);
    let srv = server::listen(cfg, Some(connection_handler), None, None)
        .await
        .unwrap();

    let _client_conn = connect_client(srv.local_addr(), Some(notify_handler)).await;

    // Give the accept path a moment to run the connection callback.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let server_conn = connections.lock().unwrap().first().cloned().unwrap();
    server_conn
        .notify("hello", json!({"a": [true, {}]}))
        .await
        .unwrap();

    let (name, data) = tokio::time::timeout(Duration::from_secs(1), notify_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "hello");
    assert_eq!(data, json!({"a": [true, {}]}));

    srv.close().await;
}

#[tokio::test]
async fn large_notify_is_delivered_intact_via_segmentation() {
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<(String, Value)>();
    let notify_handler: NotifyHandler = Arc::new(move |name, data| {
        let _ = notify_tx.send((name, data));
    });

    let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
    let connections_for_cb = connections.clone();
    let connection_handler: ConnectionHandler = Arc::new(move |conn| {
        connections_for_cb.lock().unwrap().push(conn);
    });

    let cfg = ServerConfig::new(localhost(), 0);
    let srv = server::listen(cfg, Some(connection_handler), None, None)
        .await
        .unwrap();
    let _client_conn = connect_client(srv.local_addr(), Some(notify_handler)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let big = "1".repeat(8 * 1024 * 1024);
    let server_conn = connections.lock().unwrap().first().cloned().unwrap();
    server_conn.notify("big", json!(big.clone())).await.unwrap();

    let (name, data) = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "big");
    assert_eq!(data, json!(big));

    srv.close().await;
}

#[tokio::test]
async fn empty_name_request_echoes() {
    let cfg = ServerConfig::new(localhost(), 0);
    let srv = server::listen(cfg, None, None, None).await.unwrap();
    let client_conn = connect_client(srv.local_addr(), None).await;

    let result = client_conn.request("", json!(42)).await.unwrap();
    assert_eq!(result, json!(42));

    srv.close().await;
}

#[tokio::test]
async fn request_failure_surfaces_as_remote_error() {
    let handler: RequestHandler = Arc::new(|_name, _data| {
        Box::pin(async move { Err(JugglerError::RemoteError(json!("error"))) })
    });

    let cfg = ServerConfig::new(localhost(), 0);
    let srv = server::listen(cfg, None, Some(handler), None).await.unwrap();
    let client_conn = connect_client(srv.local_addr(), None).await;

    let err = client_conn.request("boom", Value::Null).await.unwrap_err();
    assert!(matches!(err, JugglerError::RemoteError(v) if v == json!("error")));

    srv.close().await;
}

#[tokio::test]
async fn state_coalescing_converges_to_final_value() {
    let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
    let connections_for_cb = connections.clone();
    let connection_handler: ConnectionHandler = Arc::new(move |conn| {
        connections_for_cb.lock().unwrap().push(conn);
    });

    let cfg = ServerConfig::new(localhost(), 0).autoflush_delay(Some(Duration::from_micros(1000)));
    let srv = server::listen(cfg, Some(connection_handler), None, None)
        .await
        .unwrap();
    let client_conn = connect_client(srv.local_addr(), None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let server_conn = connections.lock().unwrap().first().cloned().unwrap();
    let seen_max = Arc::new(AtomicUsize::new(0));
    let seen_max_for_obs = seen_max.clone();
    let storage = server_conn.storage();
    let _reg = storage.register_change_cb(move |v| {
        if let Some(n) = v.as_u64() {
            seen_max_for_obs.fetch_max(n as usize, Ordering::SeqCst);
        }
    });

    for i in 0..10_000u64 {
        storage.set(json!(i));
    }

    let client_storage = client_conn.storage();
    for _ in 0..200 {
        if client_storage.get() == json!(9999u64) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client_storage.get(), json!(9999u64));
    assert!(seen_max.load(Ordering::SeqCst) <= 9999);

    srv.close().await;
}

#[tokio::test]
async fn state_flush_barrier_with_null_autoflush_delay() {
    let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
    let connections_for_cb = connections.clone();
    let connection_handler: ConnectionHandler = Arc::new(move |conn| {
        connections_for_cb.lock().unwrap().push(conn);
    });

    let cfg = ServerConfig::new(localhost(), 0).autoflush_delay(None);
    let srv = server::listen(cfg, Some(connection_handler), None, None)
        .await
        .unwrap();
    let client_conn = connect_client(srv.local_addr(), None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let server_conn = connections.lock().unwrap().first().cloned().unwrap();
    let storage = server_conn.storage();
    for i in 0..100u64 {
        storage.set(json!(i));
    }

    // No autoflush: the client observes nothing yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client_conn.storage().get(), Value::Null);

    server_conn.flush().await.unwrap();

    let client_storage = client_conn.storage();
    for _ in 0..100 {
        if client_storage.get() == json!(99u64) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client_storage.get(), json!(99u64));

    srv.close().await;
}

#[tokio::test]
async fn ping_keepalive_survives_idle_period() {
    let cfg = ServerConfig::new(localhost(), 0)
        .ping_delay(Duration::from_millis(10))
        .ping_timeout(Duration::from_millis(10));
    let srv = server::listen(cfg, None, None, None).await.unwrap();

    let client_cfg = ClientConfig::new(format!("ws://{}/ws", srv.local_addr()))
        .ping_delay(Duration::from_millis(10))
        .ping_timeout(Duration::from_millis(10));
    let client_conn = client::connect(client_cfg, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!client_conn.is_closed());

    srv.close().await;
}

#[tokio::test]
async fn closing_server_propagates_to_client_wait_closed() {
    let cfg = ServerConfig::new(localhost(), 0).shutdown_timeout(Duration::from_millis(50));
    let srv = server::listen(cfg, None, None, None).await.unwrap();
    let client_conn = connect_client(srv.local_addr(), None).await;

    srv.close().await;

    tokio::time::timeout(Duration::from_millis(500), client_conn.wait_closed())
        .await
        .unwrap();
}
