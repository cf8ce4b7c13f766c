//! End-to-end tests against a real server on a loopback socket.
//!
//! Each test starts the authoritative server inside a "hub" client
//! (`is_server: true`, port 0) and connects real worker clients to the port
//! the OS picked. These cover the cross-process behavior the driver unit
//! tests cannot: barrier construction, blocking waits across sockets, watch
//! push delivery, and disconnect handling.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use muster_client::{ClientError, StoreClient, StoreConfig};
use muster_proto::Request;
use tokio::{io::AsyncWriteExt, net::TcpStream};

fn cfg(port: u16) -> StoreConfig {
    StoreConfig {
        host: "127.0.0.1".to_string(),
        port,
        num_workers: None,
        is_server: false,
        timeout: Some(Duration::from_secs(5)),
        wait_workers: true,
    }
}

/// Client hosting the in-process server on an OS-assigned port.
async fn hub() -> StoreClient {
    StoreClient::connect(StoreConfig { port: 0, is_server: true, ..cfg(0) }).await.unwrap()
}

async fn worker(port: u16) -> StoreClient {
    StoreClient::connect(cfg(port)).await.unwrap()
}

/// Reserve a port for tests that need to know it before the server starts.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

#[tokio::test]
async fn barrier_releases_all_workers_together() {
    let port = free_port();
    let group = |is_server| StoreConfig {
        port,
        is_server,
        num_workers: Some(3),
        ..cfg(port)
    };

    // All three constructors block on the barrier; none may return until
    // the whole group has checked in.
    let server = tokio::spawn(StoreClient::connect(group(true)));
    let w1 = tokio::spawn(StoreClient::connect(group(false)));
    let w2 = tokio::spawn(StoreClient::connect(group(false)));

    let mut server = server.await.unwrap().unwrap();
    let w1 = w1.await.unwrap().unwrap();
    let w2 = w2.await.unwrap().unwrap();

    // The barrier counter itself lives in the store.
    assert!(server.get_num_keys().await.unwrap() >= 1);

    w1.close().await;
    w2.close().await;
    server.close().await;
}

#[tokio::test]
async fn waiter_wakes_promptly_after_set() {
    let hub = hub().await;
    let port = hub.port();
    let mut a = worker(port).await;
    let mut b = worker(port).await;

    let waiter = tokio::spawn(async move {
        a.wait_with_timeout(&["x"], Duration::from_secs(5)).await.unwrap();
        (a, Instant::now())
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    b.set("x", b"hi").await.unwrap();
    let set_done = Instant::now();

    let (mut a, woke_at) = waiter.await.unwrap();
    assert!(
        woke_at.duration_since(set_done) < Duration::from_millis(500),
        "wakeup should be push-driven, not a timeout"
    );
    assert_eq!(&a.get("x").await.unwrap()[..], b"hi");

    hub.close().await;
}

#[tokio::test]
async fn compare_set_exchanges_on_match() {
    let hub = hub().await;
    let mut w = worker(hub.port()).await;

    w.set("k", b"old").await.unwrap();
    assert_eq!(&w.compare_set("k", b"old", b"new").await.unwrap()[..], b"new");
    assert_eq!(&w.get("k").await.unwrap()[..], b"new");

    hub.close().await;
}

#[tokio::test]
async fn compare_set_mismatch_leaves_value_unchanged() {
    let hub = hub().await;
    let mut w = worker(hub.port()).await;

    w.set("k", b"old").await.unwrap();
    assert_eq!(&w.compare_set("k", b"X", b"new").await.unwrap()[..], b"old");
    assert_eq!(&w.get("k").await.unwrap()[..], b"old");

    hub.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watchers_see_every_write_in_order() {
    let hub = hub().await;
    let port = hub.port();
    let mut w1 = worker(port).await;
    let mut w2 = worker(port).await;
    let mut writer = worker(port).await;

    let (tx1, rx1) = std::sync::mpsc::channel();
    w1.watch_key("k", move |old, new| {
        let _ = tx1.send((old, new));
    })
    .await
    .unwrap();

    let (tx2, rx2) = std::sync::mpsc::channel();
    w2.watch_key("k", move |old, new| {
        let _ = tx2.send((old, new));
    })
    .await
    .unwrap();

    // Subscriptions travel on the watch sockets; give the server time to
    // record them before the writes race in on a third socket.
    tokio::time::sleep(Duration::from_millis(200)).await;

    writer.set("k", b"v1").await.unwrap();
    writer.add("k_int", 5).await.unwrap();
    writer.set("k", b"v2").await.unwrap();

    for rx in [rx1, rx2] {
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, (String::new(), "v1".to_string()));

        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second, ("v1".to_string(), "v2".to_string()));

        // The add touched a different key; no third event may arrive.
        std::thread::sleep(Duration::from_millis(200));
        assert!(rx.try_recv().is_err(), "exactly two events per watcher");
    }

    hub.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_drops_watch_subscription_silently() {
    let hub = hub().await;
    let port = hub.port();
    let mut watcher = worker(port).await;
    let mut writer = worker(port).await;

    let (tx, rx) = std::sync::mpsc::channel();
    watcher
        .watch_key("k", move |old, new| {
            let _ = tx.send((old, new));
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    writer.set("k", b"v1").await.unwrap();
    assert!(writer.delete_key("k").await.unwrap());
    writer.set("k", b"v2").await.unwrap();

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, (String::new(), "v1".to_string()));

    // The delete killed the subscription; the second set is invisible.
    std::thread::sleep(Duration::from_millis(200));
    assert!(rx.try_recv().is_err());

    hub.close().await;
}

#[tokio::test]
async fn disconnect_mid_wait_leaves_store_responsive() {
    let hub = hub().await;
    let port = hub.port();

    // A bare connection registers a wait and then vanishes without a trace.
    {
        let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = BytesMut::new();
        Request::Wait { keys: vec!["/y".to_string()] }.encode(&mut buf);
        raw.write_all(&buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut b = worker(port).await;
    let start = Instant::now();
    b.set("y", b"value").await.unwrap();
    assert!(b.get_num_keys().await.unwrap() >= 1);
    assert!(start.elapsed() < Duration::from_secs(1), "no stall from the dead waiter");

    hub.close().await;
}

#[tokio::test]
async fn add_accumulates_from_absent_key() {
    let hub = hub().await;
    let mut w = worker(hub.port()).await;

    assert_eq!(w.add("n", 17).await.unwrap(), 17);
    assert_eq!(w.add("n", 25).await.unwrap(), 42);
    assert_eq!(&w.get("n").await.unwrap()[..], b"42");

    hub.close().await;
}

#[tokio::test]
async fn delete_reports_presence_exactly_once() {
    let hub = hub().await;
    let mut w = worker(hub.port()).await;

    w.set("k", b"v").await.unwrap();
    assert!(w.delete_key("k").await.unwrap());
    assert!(!w.delete_key("k").await.unwrap());

    hub.close().await;
}

#[tokio::test]
async fn check_reflects_presence_without_blocking() {
    let hub = hub().await;
    let mut w = worker(hub.port()).await;

    assert!(!w.check(&["a", "b"]).await.unwrap());
    w.set("a", b"v").await.unwrap();
    w.set("b", b"v").await.unwrap();
    assert!(w.check(&["a", "b"]).await.unwrap());

    hub.close().await;
}

#[tokio::test]
async fn get_of_never_written_key_times_out() {
    let hub = hub().await;
    let mut w = StoreClient::connect(StoreConfig {
        timeout: Some(Duration::from_millis(300)),
        ..cfg(hub.port())
    })
    .await
    .unwrap();

    let err = w.get("never").await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    hub.close().await;
}

#[tokio::test]
async fn num_keys_counts_user_keys() {
    let hub = hub().await;
    let mut w = worker(hub.port()).await;

    w.set("one", b"1").await.unwrap();
    w.set("two", b"2").await.unwrap();
    assert!(w.get_num_keys().await.unwrap() >= 2);

    hub.close().await;
}

#[tokio::test]
async fn client_host_and_port_are_observable() {
    let hub = hub().await;
    assert_eq!(hub.host(), "127.0.0.1");
    assert_ne!(hub.port(), 0, "embedded server resolves port 0 to a real port");

    hub.close().await;
}
