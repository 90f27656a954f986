// tests/integration/purge_test.rs

//! Peer scope-actor death: the survivor must purge every row owned by the
//! departed node and run the unregister callback for each, off the actor.

use crate::integration::test_helpers::{TestCluster, wait_until};
use bytes::Bytes;
use roster::core::events::EventHandler;
use roster::Pid;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingHandler {
    unregistered: AtomicUsize,
}

impl EventHandler for CountingHandler {
    fn on_process_unregistered(&self, _scope: &str, _name: &Bytes, _pid: Pid, _meta: Bytes) {
        self.unregistered.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn test_peer_actor_down_purges_its_rows() {
    let counter = Arc::new(CountingHandler::default());
    let cluster = TestCluster::with_nodes(
        vec![
            ("a1", counter.clone() as Arc<dyn EventHandler>),
            ("b1", Arc::new(roster::core::events::DefaultHandler)),
        ],
        &[],
    )
    .await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    for i in 0..100 {
        let wa = a.spawn_process();
        a.register(format!("a-{i}"), wa.pid.clone(), Bytes::new())
            .await
            .unwrap();
        let wb = b.spawn_process();
        b.register(format!("b-{i}"), wb.pid.clone(), Bytes::new())
            .await
            .unwrap();
        b.join("g", wb.pid.clone(), Bytes::new()).await.unwrap();
    }
    assert!(wait_until(|| a.count() == 200 && b.count() == 200).await);
    assert!(wait_until(|| a.members("g").len() == 100).await);

    let b_id = b.node_id().clone();
    b.shutdown().await;

    // Every row owned by B disappears from A; A's own rows survive.
    assert!(wait_until(|| a.scope("default").count_on_node(&b_id) == 0).await);
    assert_eq!(a.count(), 100);
    assert!(wait_until(|| a.members("g").is_empty()).await);
    assert_eq!(a.group_count(), 0);

    // One unregister callback per purged registration, dispatched off the
    // actor's hot path.
    assert!(wait_until(|| counter.unregistered.load(Ordering::Relaxed) == 100).await);
}

#[tokio::test]
async fn test_survivor_reregisters_freed_names() {
    let cluster = TestCluster::new(&["a1", "b1"]).await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let wb = b.spawn_process();
    b.register("alpha", wb.pid.clone(), Bytes::new())
        .await
        .unwrap();
    assert!(wait_until(|| a.lookup("alpha").is_some()).await);

    b.shutdown().await;
    assert!(wait_until(|| a.lookup("alpha").is_none()).await);

    // The purged name is free for the survivor to claim.
    let wa = a.spawn_process();
    a.register("alpha", wa.pid.clone(), Bytes::new())
        .await
        .unwrap();
    assert_eq!(a.lookup("alpha").unwrap().0, wa.pid);
}
