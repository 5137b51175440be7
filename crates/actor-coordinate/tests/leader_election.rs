//! Lease-based leader election across nodes.
//!
//! All tests run on a paused clock; sleeping in the test advances virtual
//! time and lets the peers' heartbeats run.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use actor_coordinate::errors::CoordinateError;
use actor_coordinate::peer::ActorPeer;
use common::types::{ActorId, ConnId};
use coordinate_test_utils::{eventually, init_tracing, TestCluster};

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_elects_one_leader() {
    init_tracing();
    let cluster = TestCluster::start(3).await;
    let actor_id = cluster.create_actor("room");

    let (a, b, c) = tokio::join!(
        ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new()),
        ActorPeer::acquire(&cluster.node(1).runtime, &actor_id, ConnId::new()),
        ActorPeer::acquire(&cluster.node(2).runtime, &actor_id, ConnId::new()),
    );
    let peers = [a.unwrap(), b.unwrap(), c.unwrap()];

    let leaders: Vec<_> = peers.iter().filter(|peer| peer.is_leader()).collect();
    assert_eq!(leaders.len(), 1);

    let leader_node = leaders.first().unwrap().leader_node_id().unwrap();
    for peer in &peers {
        assert_eq!(peer.leader_node_id(), Some(leader_node));
    }
    assert_eq!(cluster.driver.lease_holder(&actor_id), Some(leader_node));

    let instantiated: usize = cluster
        .nodes
        .iter()
        .map(|node| node.actors.instantiated_count())
        .sum();
    assert_eq!(instantiated, 1);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_on_one_node_shares_peer() {
    let cluster = TestCluster::start(1).await;
    let actor_id = cluster.create_actor("room");
    let runtime = &cluster.node(0).runtime;

    let (first, second) = tokio::join!(
        ActorPeer::acquire(runtime, &actor_id, ConnId::new()),
        ActorPeer::acquire(runtime, &actor_id, ConnId::new()),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.reference_count(), 2);
    assert_eq!(runtime.actor_peer_count(), 1);
    assert_eq!(cluster.node(0).actors.instantiated_count(), 1);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leader_keeps_lease_with_heartbeat() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("room");

    let leader = ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    let follower = ActorPeer::acquire(&cluster.node(1).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    assert!(leader.is_leader());
    assert!(!follower.is_leader());

    // Many lease durations later the leader still holds it.
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(leader.is_leader());
    assert!(!leader.is_disposed());
    assert!(!follower.is_leader());
    assert_eq!(
        cluster.driver.lease_holder(&actor_id),
        Some(cluster.node(0).runtime.node_id())
    );
    assert_eq!(cluster.node(1).actors.instantiated_count(), 0);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_from_unreachable_leader() {
    init_tracing();
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("room");
    let (node_a, node_b) = (cluster.node(0), cluster.node(1));

    let leader = ActorPeer::acquire(&node_a.runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    let follower = ActorPeer::acquire(&node_b.runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    assert!(leader.is_leader());

    cluster.driver.isolate(node_a.runtime.node_id());

    // Renewals keep failing; once a lease duration has passed since the last
    // one that succeeded, the old leader stops on its own, without being
    // able to reach the backend.
    let lease = node_a.runtime.config().lease_duration;
    tokio::time::sleep(lease - Duration::from_millis(100)).await;
    assert!(leader.is_leader());
    assert!(!leader.is_disposed());
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(leader.is_disposed());
    assert!(node_a.runtime.actor_peer(&actor_id).is_none());
    assert!(node_a.actors.actor(&actor_id).is_stopped());

    // Follower checks every 1000-1500ms.
    eventually("follower promoted", || follower.is_leader()).await;
    assert_eq!(
        cluster.driver.lease_holder(&actor_id),
        Some(node_b.runtime.node_id())
    );
    assert!(node_b.actors.actor(&actor_id).is_started());

    cluster.driver.heal(node_a.runtime.node_id());
    tokio::time::sleep(lease).await;
    assert_eq!(
        cluster.driver.lease_holder(&actor_id),
        Some(node_b.runtime.node_id())
    );
    assert_eq!(node_a.actors.instantiated_count(), 1);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_subscription_hands_actor_to_another_node() {
    init_tracing();
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("room");
    let (node_a, node_b) = (cluster.node(0), cluster.node(1));

    let leader = ActorPeer::acquire(&node_a.runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    let follower = ActorPeer::acquire(&node_b.runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    assert!(leader.is_leader());

    // The node can still renew leases but no longer hears anything.
    cluster.driver.close_subscription(node_a.runtime.node_id());

    eventually("deaf node halted", || node_a.runtime.is_shut_down()).await;
    eventually("deaf leader disposed", || leader.is_disposed()).await;
    assert!(node_a.actors.actor(&actor_id).is_stopped());

    eventually("follower promoted", || follower.is_leader()).await;
    assert_eq!(
        cluster.driver.lease_holder(&actor_id),
        Some(node_b.runtime.node_id())
    );
    assert!(node_b.actors.actor(&actor_id).is_started());

    let refused = ActorPeer::acquire(&node_a.runtime, &actor_id, ConnId::new()).await;
    assert!(matches!(refused, Err(CoordinateError::Cancelled)));
    assert_eq!(
        cluster.driver.lease_holder(&actor_id),
        Some(node_b.runtime.node_id())
    );

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_last_reference_disposes_and_releases() {
    let cluster = TestCluster::start(1).await;
    let actor_id = cluster.create_actor("room");
    let runtime = &cluster.node(0).runtime;

    let (conn_a, conn_b) = (ConnId::new(), ConnId::new());
    let peer = ActorPeer::acquire(runtime, &actor_id, conn_a).await.unwrap();
    ActorPeer::acquire(runtime, &actor_id, conn_b).await.unwrap();

    peer.remove_reference(conn_a).await;
    assert!(!peer.is_disposed());
    assert!(cluster.driver.lease_holder(&actor_id).is_some());

    peer.remove_reference(conn_b).await;
    assert!(peer.is_disposed());
    assert!(runtime.actor_peer(&actor_id).is_none());
    assert_eq!(cluster.driver.lease_holder(&actor_id), None);
    assert!(cluster.node(0).actors.actor(&actor_id).is_stopped());

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_reference_is_ignored() {
    let cluster = TestCluster::start(1).await;
    let actor_id = cluster.create_actor("room");
    let runtime = &cluster.node(0).runtime;

    let conn = ConnId::new();
    let peer = ActorPeer::acquire(runtime, &actor_id, conn).await.unwrap();
    ActorPeer::acquire(runtime, &actor_id, ConnId::new()).await.unwrap();

    peer.remove_reference(ConnId::new()).await;
    assert_eq!(peer.reference_count(), 2);
    assert!(!peer.is_disposed());

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispose_is_idempotent() {
    let cluster = TestCluster::start(1).await;
    let actor_id = cluster.create_actor("room");
    let runtime = &cluster.node(0).runtime;

    let peer = ActorPeer::acquire(runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    peer.dispose(true).await;
    peer.dispose(true).await;

    assert!(peer.is_disposed());
    assert_eq!(cluster.driver.lease_holder(&actor_id), None);

    // A fresh acquire builds a new peer and a new actor instance.
    let fresh = ActorPeer::acquire(runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    assert!(!std::sync::Arc::ptr_eq(&peer, &fresh));
    assert!(fresh.is_leader());
    assert_eq!(cluster.node(0).actors.instantiated_count(), 2);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_acquire_unknown_actor_fails() {
    let cluster = TestCluster::start(1).await;
    let runtime = &cluster.node(0).runtime;
    let ghost = ActorId::from("ghost");

    let result = ActorPeer::acquire(runtime, &ghost, ConnId::new()).await;

    assert!(matches!(result, Err(CoordinateError::ActorNotFound(id)) if id == ghost));
    assert!(runtime.actor_peer(&ghost).is_none());

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_actor_start_releases_lease() {
    let mut cluster = TestCluster::start(0).await;
    let failing = cluster.add_failing_node().await;
    let actor_id = cluster.create_actor("room");
    let runtime = &cluster.node(failing).runtime;

    let result = ActorPeer::acquire(runtime, &actor_id, ConnId::new()).await;

    assert!(matches!(result, Err(CoordinateError::ActorFailed(e)) if e.code == "instantiate_failed"));
    assert!(runtime.actor_peer(&actor_id).is_none());
    assert_eq!(cluster.driver.lease_holder(&actor_id), None);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_hands_over_quickly() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("room");
    let (node_a, node_b) = (cluster.node(0), cluster.node(1));

    ActorPeer::acquire(&node_a.runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    let follower = ActorPeer::acquire(&node_b.runtime, &actor_id, ConnId::new())
        .await
        .unwrap();

    node_a.runtime.shutdown().await;
    assert_eq!(cluster.driver.lease_holder(&actor_id), None);
    assert!(node_a.actors.actor(&actor_id).is_stopped());

    // One follower check (interval + jitter) is enough; no expiry wait.
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(follower.is_leader());

    cluster.shutdown().await;
}
