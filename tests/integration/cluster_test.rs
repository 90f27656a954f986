// tests/integration/cluster_test.rs

//! End-to-end registry behavior across a multi-node mesh.

use crate::integration::test_helpers::{TestCluster, wait_until};
use bytes::Bytes;
use roster::{ExitReason, RosterError};

#[tokio::test]
async fn test_register_is_visible_on_peer() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    a.register("alpha", worker.pid.clone(), "role=leader")
        .await
        .unwrap();

    assert_eq!(
        a.lookup("alpha"),
        Some((worker.pid.clone(), Bytes::from("role=leader")))
    );
    assert!(
        wait_until(|| b.lookup("alpha") == Some((worker.pid.clone(), Bytes::from("role=leader"))))
            .await
    );
}

#[tokio::test]
async fn test_register_taken_name_is_rejected() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let a = cluster.node(0);

    let first = a.spawn_process();
    let second = a.spawn_process();
    a.register("alpha", first.pid.clone(), Bytes::new())
        .await
        .unwrap();

    let err = a
        .register("alpha", second.pid.clone(), Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err, RosterError::Taken);
    assert_eq!(a.lookup("alpha").unwrap().0, first.pid);
}

#[tokio::test]
async fn test_process_death_evicts_everywhere() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    a.register("alpha", worker.pid.clone(), Bytes::new())
        .await
        .unwrap();
    assert!(wait_until(|| b.lookup("alpha").is_some()).await);

    a.processes().kill(&worker.pid, ExitReason::Killed);
    assert!(wait_until(|| a.lookup("alpha").is_none()).await);
    assert!(wait_until(|| b.lookup("alpha").is_none()).await);
}

#[tokio::test]
async fn test_remote_register_reads_its_own_write() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    // The pid lives on A; B issues the register, which routes to A's actor.
    let worker = a.spawn_process();
    b.register("alpha", worker.pid.clone(), "m1").await.unwrap();

    // No waiting: the requester mirrors the owner's mutation before `ok`.
    assert_eq!(
        b.lookup("alpha"),
        Some((worker.pid.clone(), Bytes::from("m1")))
    );
    assert_eq!(a.lookup("alpha").unwrap().0, worker.pid);
}

#[tokio::test]
async fn test_remote_register_dead_pid_is_not_alive() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    a.processes().kill(&worker.pid, ExitReason::Killed);

    let err = b
        .register("alpha", worker.pid.clone(), Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err, RosterError::NotAlive);
    assert!(b.lookup("alpha").is_none());
}

#[tokio::test]
async fn test_unregister_returns_scope_to_prior_state() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    a.register("alpha", worker.pid.clone(), Bytes::new())
        .await
        .unwrap();
    assert!(wait_until(|| b.lookup("alpha").is_some()).await);

    a.unregister("alpha").await.unwrap();
    assert!(a.lookup("alpha").is_none());
    assert!(wait_until(|| b.lookup("alpha").is_none()).await);
    assert_eq!(a.count(), 0);

    // The name is free again.
    let err = a.unregister("alpha").await.unwrap_err();
    assert_eq!(err, RosterError::Undefined);
}

#[tokio::test]
async fn test_remote_unregister_mirrors_locally() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    a.register("alpha", worker.pid.clone(), Bytes::new())
        .await
        .unwrap();
    assert!(wait_until(|| b.lookup("alpha").is_some()).await);

    b.unregister("alpha").await.unwrap();
    assert!(b.lookup("alpha").is_none());
    assert!(wait_until(|| a.lookup("alpha").is_none()).await);
}

#[tokio::test]
async fn test_reregistration_updates_meta_in_place() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    let first = a
        .register("alpha", worker.pid.clone(), "v1")
        .await
        .unwrap();
    assert!(first.previous.is_none());

    let second = a
        .register("alpha", worker.pid.clone(), "v2")
        .await
        .unwrap();
    assert_eq!(
        second.previous,
        Some((worker.pid.clone(), Bytes::from("v1")))
    );
    assert!(second.time > first.time);

    assert_eq!(a.lookup("alpha").unwrap().1, Bytes::from("v2"));
    assert!(wait_until(|| b.lookup("alpha").map(|(_, m)| m) == Some(Bytes::from("v2"))).await);
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let a = cluster.node(0);

    let worker = a.spawn_process();
    a.register("alpha", worker.pid.clone(), "m").await.unwrap();
    a.join("g", worker.pid.clone(), Bytes::new()).await.unwrap();

    // A third node attaches after the fact and must converge via ACK_SYNC.
    let late = roster::Node::start(roster::config::Config::new("c1"), &cluster.bus).unwrap();
    assert!(wait_until(|| late.lookup("alpha").is_some()).await);
    assert!(wait_until(|| late.members("g").len() == 1).await);
    assert_eq!(late.count(), 1);

    late.shutdown().await;
}

#[tokio::test]
async fn test_counts_per_node() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wa = a.spawn_process();
    let wb = b.spawn_process();
    a.register("alpha", wa.pid.clone(), Bytes::new())
        .await
        .unwrap();
    b.register("beta", wb.pid.clone(), Bytes::new())
        .await
        .unwrap();

    assert!(wait_until(|| a.count() == 2 && b.count() == 2).await);
    assert_eq!(a.scope("default").count_on_node(a.node_id()), 1);
    assert_eq!(a.scope("default").count_on_node(b.node_id()), 1);
}

#[tokio::test]
async fn test_scopes_are_independent() {
    let cluster = TestCluster::with_scopes(&["a1", "b1"], &["s1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    a.scope("s1")
        .register("alpha", worker.pid.clone(), Bytes::new())
        .await
        .unwrap();

    assert_eq!(a.scope("s1").name(), "s1");
    assert!(wait_until(|| b.scope("s1").lookup("alpha").is_some()).await);
    assert!(a.lookup("alpha").is_none());
    assert_eq!(a.count(), 0);
    assert_eq!(a.scope("s1").count(), 1);
}

#[tokio::test]
#[should_panic(expected = "invalid scope")]
async fn test_unknown_scope_panics() {
    let cluster = TestCluster::new(&["a1"]).await;
    let _ = cluster.node(0).scope("nope").count();
}

#[tokio::test]
async fn test_call_to_unreachable_owner_fails() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let worker = a.spawn_process();
    cluster.partition(0, 1);
    cluster.settle().await;

    let err = b
        .register("alpha", worker.pid.clone(), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RosterError::Transport(_)));
}
