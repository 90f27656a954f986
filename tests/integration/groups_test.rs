// tests/integration/groups_test.rs

//! End-to-end process-group behavior across the mesh.

use crate::integration::test_helpers::{TestCluster, wait_until};
use bytes::Bytes;
use roster::ExitReason;

fn pids(mut members: Vec<(roster::Pid, Bytes)>) -> Vec<roster::Pid> {
    members.sort_by(|(a, _), (b, _)| a.cmp(b));
    members.into_iter().map(|(pid, _)| pid).collect()
}

#[tokio::test]
async fn test_join_is_visible_on_both_nodes() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wa = a.spawn_process();
    let wb = b.spawn_process();
    a.join("g", wa.pid.clone(), Bytes::new()).await.unwrap();
    b.join("g", wb.pid.clone(), Bytes::new()).await.unwrap();

    let mut expected = vec![wa.pid.clone(), wb.pid.clone()];
    expected.sort();
    assert!(wait_until(|| pids(a.members("g")) == expected).await);
    assert!(wait_until(|| pids(b.members("g")) == expected).await);
    assert_eq!(a.group_count(), 1);
    assert_eq!(b.group_count(), 1);
}

#[tokio::test]
async fn test_member_death_leaves_group_everywhere() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wa = a.spawn_process();
    let wb = b.spawn_process();
    a.join("g", wa.pid.clone(), Bytes::new()).await.unwrap();
    b.join("g", wb.pid.clone(), Bytes::new()).await.unwrap();
    assert!(wait_until(|| a.members("g").len() == 2 && b.members("g").len() == 2).await);

    a.processes().kill(&wa.pid, ExitReason::Killed);

    assert!(wait_until(|| pids(a.members("g")) == vec![wb.pid.clone()]).await);
    assert!(wait_until(|| pids(b.members("g")) == vec![wb.pid.clone()]).await);
}

#[tokio::test]
async fn test_explicit_leave_propagates() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wa = a.spawn_process();
    a.join("g", wa.pid.clone(), "m").await.unwrap();
    assert!(wait_until(|| b.members("g").len() == 1).await);

    a.leave("g", &wa.pid).await.unwrap();
    assert!(a.members("g").is_empty());
    assert!(wait_until(|| b.members("g").is_empty()).await);
    assert_eq!(a.group_count(), 0);

    let err = a.leave("g", &wa.pid).await.unwrap_err();
    assert_eq!(err, roster::RosterError::Undefined);
}

#[tokio::test]
async fn test_remote_join_and_leave_mirror_locally() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wa = a.spawn_process();
    // B drives the membership of A's process.
    b.join("g", wa.pid.clone(), "m").await.unwrap();
    assert_eq!(pids(b.members("g")), vec![wa.pid.clone()]);
    assert!(wait_until(|| a.members("g").len() == 1).await);

    b.leave("g", &wa.pid).await.unwrap();
    assert!(b.members("g").is_empty());
    assert!(wait_until(|| a.members("g").is_empty()).await);
}

#[tokio::test]
async fn test_join_dead_pid_is_not_alive() {
    let cluster = TestCluster::new(&["a1"]).await;
    let a = cluster.node(0);

    let wa = a.spawn_process();
    a.processes().kill(&wa.pid, ExitReason::Killed);

    let err = a.join("g", wa.pid.clone(), Bytes::new()).await.unwrap_err();
    assert_eq!(err, roster::RosterError::NotAlive);
    assert!(a.members("g").is_empty());
}

#[tokio::test]
async fn test_pid_in_many_groups_and_local_members() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wa = a.spawn_process();
    let wb = b.spawn_process();
    a.join("g1", wa.pid.clone(), Bytes::new()).await.unwrap();
    a.join("g2", wa.pid.clone(), Bytes::new()).await.unwrap();
    b.join("g1", wb.pid.clone(), Bytes::new()).await.unwrap();

    assert!(wait_until(|| a.members("g1").len() == 2).await);
    assert_eq!(a.group_count(), 2);
    assert_eq!(
        a.scope("default").group_count_on_node(a.node_id()),
        2
    );
    assert_eq!(
        a.scope("default").group_count_on_node(b.node_id()),
        1
    );
    assert_eq!(
        pids(a.scope("default").local_members("g1")),
        vec![wa.pid.clone()]
    );

    // Killing the multi-group member clears both groups cluster-wide.
    a.processes().kill(&wa.pid, ExitReason::Killed);
    assert!(wait_until(|| b.members("g2").is_empty() && b.group_count() == 1).await);
}

#[tokio::test]
async fn test_rejoin_updates_meta() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wa = a.spawn_process();
    a.join("g", wa.pid.clone(), "v1").await.unwrap();
    a.join("g", wa.pid.clone(), "v2").await.unwrap();

    assert_eq!(a.members("g"), vec![(wa.pid.clone(), Bytes::from("v2"))]);
    assert!(
        wait_until(|| b.members("g") == vec![(wa.pid.clone(), Bytes::from("v2"))]).await
    );
}
