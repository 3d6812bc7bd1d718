//! Watch propagation tests: broadcaster, HTTP streams and notifier routing.

mod common;

use common::{api_state, local_store, membership, TestServer};
use kvsql::api::ApiClient;
use kvsql::cluster::{LocalCluster, NodeInfo, NodeRole};
use kvsql::core::error::KvsqlError;
use kvsql::kv::KeyValue;
use kvsql::net::upgrade::{request_upgrade, UpgradeRequest};
use kvsql::net::{PlainTransport, Transport};
use kvsql::watch::client::watch;
use kvsql::watch::{ClusterNotifier, Event, Notifier, WATCH_PROTOCOL};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn next(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watch event within 5s")
        .expect("watch channel open")
}

fn transport() -> Arc<dyn Transport> {
    Arc::new(PlainTransport)
}

fn row(key: &str, revision: i64) -> KeyValue {
    KeyValue {
        id: revision,
        key: key.to_string(),
        value: b"v".to_vec(),
        old_value: Vec::new(),
        old_revision: 0,
        create_revision: revision,
        revision,
        ttl: 0,
        version: 1,
        del: false,
    }
}

// ============================================================================
// Watch streams over HTTP upgrade
// ============================================================================

#[tokio::test]
async fn watch_replays_from_revision_then_streams_live() {
    let (store, broadcaster) = local_store();
    // revisions: foo=2, bar=3, foo=4, foo=5, bar=6, foo=7
    for key in ["foo", "bar", "foo", "foo", "bar", "foo"] {
        store.update(key, key.as_bytes(), 0, 0).await.unwrap();
    }

    let server = TestServer::start(api_state(store.clone(), broadcaster, "127.0.0.1:1")).await;
    let mut rx = watch(transport(), &server.address(), "foo", 5, CancellationToken::new());

    assert!(next(&mut rx).await.start);

    let replayed: Vec<i64> = vec![
        next(&mut rx).await.kv.unwrap().revision,
        next(&mut rx).await.kv.unwrap().revision,
    ];
    assert_eq!(replayed, vec![5, 7]);

    store.update("bar", b"x", 0, 0).await.unwrap();
    let (_, live) = store.update("foo", b"y", 0, 0).await.unwrap();

    let event = next(&mut rx).await;
    assert_eq!(event.kv.unwrap(), live);

    server.stop();
}

#[tokio::test]
async fn prefix_watch_replays_tombstones() {
    let (store, broadcaster) = local_store();
    store.update("/r/a", b"1", 0, 0).await.unwrap();
    store.update("/other", b"1", 0, 0).await.unwrap();
    store.delete("/r/a", 0).await.unwrap();

    let server = TestServer::start(api_state(store.clone(), broadcaster, "127.0.0.1:1")).await;
    let mut rx = watch(transport(), &server.address(), "/r/%", 1, CancellationToken::new());

    assert!(next(&mut rx).await.start);
    let put = next(&mut rx).await.kv.unwrap();
    let del = next(&mut rx).await.kv.unwrap();
    assert_eq!(put.key, "/r/a");
    assert!(!put.del);
    assert!(del.del);
    assert!(del.revision > put.revision);

    server.stop();
}

#[tokio::test]
async fn live_only_watch_skips_history() {
    let (store, broadcaster) = local_store();
    store.update("k", b"old", 0, 0).await.unwrap();

    let server = TestServer::start(api_state(store.clone(), broadcaster, "127.0.0.1:1")).await;
    let mut rx = watch(transport(), &server.address(), "k", 0, CancellationToken::new());
    assert!(next(&mut rx).await.start);

    let (_, kv) = store.update("k", b"new", 0, 0).await.unwrap();
    assert_eq!(next(&mut rx).await.kv.unwrap().value, kv.value);

    server.stop();
}

#[tokio::test]
async fn server_shutdown_ends_stream_with_error() {
    let (store, broadcaster) = local_store();
    let server = TestServer::start(api_state(store, broadcaster, "127.0.0.1:1")).await;

    let mut rx = watch(transport(), &server.address(), "k", 0, CancellationToken::new());
    assert!(next(&mut rx).await.start);

    server.stop();
    let event = next(&mut rx).await;
    assert!(event.err.is_some());
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn cancelled_watch_closes_without_error() {
    let (store, broadcaster) = local_store();
    let server = TestServer::start(api_state(store, broadcaster, "127.0.0.1:1")).await;

    let cancel = CancellationToken::new();
    let mut rx = watch(transport(), &server.address(), "k", 0, cancel.clone());
    assert!(next(&mut rx).await.start);

    cancel.cancel();
    let end = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert!(end.is_none());

    server.stop();
}

#[tokio::test]
async fn watch_upgrade_rejects_missing_headers() {
    let (store, broadcaster) = local_store();
    let server = TestServer::start(api_state(store, broadcaster, "127.0.0.1:1")).await;

    let mut request = UpgradeRequest::watch(&server.address(), "k", 0);
    request.headers.clear();
    assert_eq!(request.protocol, WATCH_PROTOCOL);

    let stream = transport().connect(&server.address()).await.unwrap();
    match request_upgrade(stream, &request).await {
        Err(KvsqlError::Upgrade { message }) => assert!(message.contains("400")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("upgrade should be refused"),
    }

    server.stop();
}

// ============================================================================
// Notification routing
// ============================================================================

#[tokio::test]
async fn post_watch_publishes_to_broadcaster() {
    let (store, broadcaster) = local_store();
    let mut sub = broadcaster.subscribe(CancellationToken::new());
    let server = TestServer::start(api_state(store, broadcaster, "127.0.0.1:1")).await;

    let client = ApiClient::new(transport());
    client.notify(&server.address(), &row("/posted", 42)).await.unwrap();

    let kv = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kv, row("/posted", 42));

    server.stop();
}

#[tokio::test]
async fn cluster_notifier_publishes_locally_on_leader() {
    let (_, broadcaster) = local_store();
    let mut sub = broadcaster.subscribe(CancellationToken::new());

    let cluster = LocalCluster::bootstrap(1, "10.0.0.1:9000");
    let notifier = ClusterNotifier::new(
        broadcaster.clone(),
        membership(&cluster, "10.0.0.1:9000"),
        ApiClient::new(transport()),
    );

    notifier.notify(&row("/local", 9)).await.unwrap();
    assert_eq!(sub.recv().await.unwrap().revision, 9);
}

#[tokio::test]
async fn cluster_notifier_forwards_to_remote_leader() {
    // The leader's API server, with its own broadcaster.
    let (leader_store, leader_broadcaster) = local_store();
    let mut leader_sub = leader_broadcaster.subscribe(CancellationToken::new());
    let server =
        TestServer::start(api_state(leader_store, leader_broadcaster, "127.0.0.1:1")).await;

    // Follower whose engine reports the server as leader.
    let cluster = LocalCluster::bootstrap(1, server.address());
    cluster.insert(NodeInfo::new(2, "10.0.0.2:9000", NodeRole::Voter));
    let (_, follower_broadcaster) = local_store();
    let mut follower_sub = follower_broadcaster.subscribe(CancellationToken::new());

    let notifier = ClusterNotifier::new(
        follower_broadcaster,
        membership(&cluster, "10.0.0.2:9000"),
        ApiClient::new(transport()),
    );
    notifier.notify(&row("/remote", 11)).await.unwrap();

    let kv = tokio::time::timeout(Duration::from_secs(5), leader_sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kv.key, "/remote");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), follower_sub.recv())
            .await
            .is_err(),
        "follower must not publish locally"
    );

    server.stop();
}

#[tokio::test]
async fn cluster_notifier_without_leader_fails() {
    let (_, broadcaster) = local_store();
    let cluster = LocalCluster::bootstrap(1, "10.0.0.1:9000");
    cluster.set_unreachable("10.0.0.1:9000", true);

    let notifier = ClusterNotifier::new(
        broadcaster,
        membership(&cluster, "10.0.0.1:9000"),
        ApiClient::new(transport()),
    );
    let err = notifier.notify(&row("/k", 1)).await.unwrap_err();
    assert!(matches!(err, KvsqlError::Notification { .. }));
}
