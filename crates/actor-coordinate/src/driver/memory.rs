//! In-process coordinate driver.
//!
//! All nodes created from clones of one [`MemoryCoordinateDriver`] share a
//! single backend, which makes it possible to run a whole cluster inside one
//! process. Every operation runs under one mutex, so lease operations are
//! atomic. Expiry uses `tokio::time::Instant`, which follows paused test time.

use super::{ActorMetadata, CoordinateDriver, LeaderLookup, LeaseGrant, NodeSubscriber};
use crate::errors::CoordinateError;
use async_trait::async_trait;
use bytes::Bytes;
use common::types::{ActorId, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone)]
struct MemoryLease {
    holder: NodeId,
    expires_at: Instant,
}

impl MemoryLease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct MemoryState {
    actors: HashMap<ActorId, ActorMetadata>,
    leases: HashMap<ActorId, MemoryLease>,
    subscribers: HashMap<NodeId, mpsc::UnboundedSender<Bytes>>,
    partitioned: HashSet<NodeId>,
    isolated: HashSet<NodeId>,
    published: HashMap<NodeId, usize>,
}

impl MemoryState {
    fn reachable(&self, node_id: NodeId) -> Result<(), CoordinateError> {
        if self.isolated.contains(&node_id) {
            return Err(CoordinateError::Driver(format!(
                "node {node_id} cannot reach the backend"
            )));
        }
        Ok(())
    }

    fn live_holder(&mut self, actor_id: &ActorId, now: Instant) -> Option<NodeId> {
        match self.leases.get(actor_id) {
            Some(lease) if lease.is_live(now) => Some(lease.holder),
            Some(_) => {
                self.leases.remove(actor_id);
                None
            }
            None => None,
        }
    }

    fn acquire(&mut self, actor_id: &ActorId, node_id: NodeId, dur: Duration) -> NodeId {
        let now = Instant::now();
        if let Some(holder) = self.live_holder(actor_id, now) {
            return holder;
        }
        self.leases.insert(
            actor_id.clone(),
            MemoryLease {
                holder: node_id,
                expires_at: now + dur,
            },
        );
        node_id
    }
}

/// Shared in-memory lease store and message bus.
#[derive(Clone, Default)]
pub struct MemoryCoordinateDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCoordinateDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record actor metadata. Returns `false` if the actor already exists.
    pub fn create_actor(&self, actor_id: &ActorId, metadata: ActorMetadata) -> bool {
        let mut state = self.state();
        if state.actors.contains_key(actor_id) {
            return false;
        }
        state.actors.insert(actor_id.clone(), metadata);
        true
    }

    /// Current live lease holder, if any.
    pub fn lease_holder(&self, actor_id: &ActorId) -> Option<NodeId> {
        self.state().live_holder(actor_id, Instant::now())
    }

    /// Drop every message published to `node_id` until [`Self::heal`].
    pub fn partition(&self, node_id: NodeId) {
        self.state().partitioned.insert(node_id);
    }

    /// Partition `node_id` and fail its lease operations. Its leases run
    /// out on their own.
    ///
    /// Publishes and leader lookups carry no caller identity, so the node
    /// can still send; only what is addressed to it or done in its name
    /// fails.
    pub fn isolate(&self, node_id: NodeId) {
        let mut state = self.state();
        state.partitioned.insert(node_id);
        state.isolated.insert(node_id);
    }

    /// Undo [`Self::partition`] and [`Self::isolate`].
    pub fn heal(&self, node_id: NodeId) {
        let mut state = self.state();
        state.partitioned.remove(&node_id);
        state.isolated.remove(&node_id);
    }

    /// End the subscription of `node_id`, as when the backend drops its
    /// pub/sub connection. The node can still reach the lease store.
    pub fn close_subscription(&self, node_id: NodeId) {
        self.state().subscribers.remove(&node_id);
    }

    /// Number of publish calls addressed to `node_id`, including dropped ones.
    pub fn published_count(&self, node_id: NodeId) -> usize {
        self.state().published.get(&node_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CoordinateDriver for MemoryCoordinateDriver {
    async fn create_node_subscriber(
        &self,
        node_id: NodeId,
    ) -> Result<NodeSubscriber, CoordinateError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let previous = self.state().subscribers.insert(node_id, sender);
        if previous.is_some() {
            debug!(
                target: "coordinate.driver.memory",
                node_id = %node_id,
                "Replaced existing node subscriber"
            );
        }
        Ok(receiver)
    }

    async fn publish_to_node(
        &self,
        target: NodeId,
        message: Bytes,
    ) -> Result<(), CoordinateError> {
        let mut state = self.state();
        *state.published.entry(target).or_insert(0) += 1;

        if state.partitioned.contains(&target) {
            trace!(
                target: "coordinate.driver.memory",
                node_id = %target,
                "Dropping message to partitioned node"
            );
            return Ok(());
        }

        // Publishing to a node nobody listens on is not an error, matching pub/sub.
        let closed = match state.subscribers.get(&target) {
            Some(sender) => sender.send(message).is_err(),
            None => false,
        };
        if closed {
            state.subscribers.remove(&target);
        }
        Ok(())
    }

    async fn get_leader(&self, actor_id: &ActorId) -> Result<LeaderLookup, CoordinateError> {
        let mut state = self.state();
        if !state.actors.contains_key(actor_id) {
            return Ok(LeaderLookup::NotStarted);
        }
        Ok(match state.live_holder(actor_id, Instant::now()) {
            Some(holder) => LeaderLookup::Leader(holder),
            None => LeaderLookup::Unleased,
        })
    }

    #[instrument(skip_all, fields(actor_id = %actor_id, node_id = %node_id))]
    async fn start_and_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<Option<LeaseGrant>, CoordinateError> {
        let mut state = self.state();
        state.reachable(node_id)?;
        let Some(metadata) = state.actors.get(actor_id).cloned() else {
            return Ok(None);
        };
        let leader_node_id = state.acquire(actor_id, node_id, lease_duration);
        Ok(Some(LeaseGrant {
            metadata,
            leader_node_id,
        }))
    }

    async fn extend_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<bool, CoordinateError> {
        let mut state = self.state();
        state.reachable(node_id)?;
        let now = Instant::now();
        if state.live_holder(actor_id, now) != Some(node_id) {
            return Ok(false);
        }
        state.leases.insert(
            actor_id.clone(),
            MemoryLease {
                holder: node_id,
                expires_at: now + lease_duration,
            },
        );
        Ok(true)
    }

    async fn attempt_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<NodeId, CoordinateError> {
        let mut state = self.state();
        state.reachable(node_id)?;
        Ok(state.acquire(actor_id, node_id, lease_duration))
    }

    async fn release_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
    ) -> Result<(), CoordinateError> {
        let mut state = self.state();
        state.reachable(node_id)?;
        if state.live_holder(actor_id, Instant::now()) == Some(node_id) {
            state.leases.remove(actor_id);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_millis(3000);

    fn driver_with_actor(actor_id: &ActorId) -> MemoryCoordinateDriver {
        let driver = MemoryCoordinateDriver::new();
        driver.create_actor(
            actor_id,
            ActorMetadata {
                name: "counter".to_string(),
                key: vec!["k".to_string()],
            },
        );
        driver
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_acquire_returns_holder_until_expiry() {
        let actor = ActorId::from("a1");
        let driver = driver_with_actor(&actor);
        let (a, b) = (NodeId::new(), NodeId::new());

        assert_eq!(driver.attempt_acquire_lease(&actor, a, LEASE).await.unwrap(), a);

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert_eq!(driver.attempt_acquire_lease(&actor, b, LEASE).await.unwrap(), a);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(driver.attempt_acquire_lease(&actor, b, LEASE).await.unwrap(), b);
        assert_eq!(driver.lease_holder(&actor), Some(b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_only_succeeds_for_holder() {
        let actor = ActorId::from("a1");
        let driver = driver_with_actor(&actor);
        let (a, b) = (NodeId::new(), NodeId::new());

        driver.attempt_acquire_lease(&actor, a, LEASE).await.unwrap();
        assert!(!driver.extend_lease(&actor, b, LEASE).await.unwrap());

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert!(driver.extend_lease(&actor, a, LEASE).await.unwrap());

        // Extension pushed expiry out to t=5000
        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(driver.lease_holder(&actor), Some(a));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!driver.extend_lease(&actor, a, LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_owner_only() {
        let actor = ActorId::from("a1");
        let driver = driver_with_actor(&actor);
        let (a, b) = (NodeId::new(), NodeId::new());

        driver.attempt_acquire_lease(&actor, a, LEASE).await.unwrap();
        driver.release_lease(&actor, b).await.unwrap();
        assert_eq!(driver.lease_holder(&actor), Some(a));

        driver.release_lease(&actor, a).await.unwrap();
        assert_eq!(driver.lease_holder(&actor), None);
        assert_eq!(
            driver.get_leader(&actor).await.unwrap(),
            LeaderLookup::Unleased
        );
    }

    #[tokio::test]
    async fn test_start_and_acquire_requires_metadata() {
        let driver = MemoryCoordinateDriver::new();
        let actor = ActorId::from("ghost");

        assert!(driver
            .start_and_acquire_lease(&actor, NodeId::new(), LEASE)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            driver.get_leader(&actor).await.unwrap(),
            LeaderLookup::NotStarted
        );
    }

    #[tokio::test]
    async fn test_start_and_acquire_is_idempotent() {
        let actor = ActorId::from("a1");
        let driver = driver_with_actor(&actor);
        let (a, b) = (NodeId::new(), NodeId::new());

        let first = driver
            .start_and_acquire_lease(&actor, a, LEASE)
            .await
            .unwrap()
            .unwrap();
        let second = driver
            .start_and_acquire_lease(&actor, b, LEASE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.leader_node_id, a);
        assert_eq!(second.leader_node_id, a);
        assert_eq!(second.metadata.name, "counter");
    }

    #[tokio::test]
    async fn test_concurrent_acquire_elects_one_leader() {
        let actor = ActorId::from("contested");
        let driver = driver_with_actor(&actor);
        let nodes: Vec<NodeId> = (0..16).map(|_| NodeId::new()).collect();

        let mut tasks = Vec::new();
        for node in &nodes {
            let driver = driver.clone();
            let actor = actor.clone();
            let node = *node;
            tasks.push(tokio::spawn(async move {
                driver.attempt_acquire_lease(&actor, node, LEASE).await
            }));
        }

        let mut winners = HashSet::new();
        for task in tasks {
            winners.insert(task.await.unwrap().unwrap());
        }
        assert_eq!(winners.len(), 1);
        assert!(nodes.contains(winners.iter().next().unwrap()));
    }

    #[tokio::test]
    async fn test_publish_and_partition() {
        let driver = MemoryCoordinateDriver::new();
        let node = NodeId::new();
        let mut sub = driver.create_node_subscriber(node).await.unwrap();

        driver
            .publish_to_node(node, Bytes::from_static(b"one"))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"one"));

        driver.partition(node);
        driver
            .publish_to_node(node, Bytes::from_static(b"lost"))
            .await
            .unwrap();
        driver.heal(node);
        driver
            .publish_to_node(node, Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(driver.published_count(node), 3);
    }

    #[tokio::test]
    async fn test_closed_subscription_ends_stream() {
        let actor = ActorId::from("a1");
        let driver = driver_with_actor(&actor);
        let node = NodeId::new();
        let mut sub = driver.create_node_subscriber(node).await.unwrap();

        driver.close_subscription(node);

        assert!(sub.recv().await.is_none());
        // Lease operations are unaffected.
        assert_eq!(
            driver.attempt_acquire_lease(&actor, node, LEASE).await.unwrap(),
            node
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_node_loses_lease_after_expiry() {
        let actor = ActorId::from("a1");
        let driver = driver_with_actor(&actor);
        let (a, b) = (NodeId::new(), NodeId::new());

        driver.attempt_acquire_lease(&actor, a, LEASE).await.unwrap();
        driver.isolate(a);

        assert!(matches!(
            driver.extend_lease(&actor, a, LEASE).await,
            Err(CoordinateError::Driver(_))
        ));
        assert_eq!(driver.attempt_acquire_lease(&actor, b, LEASE).await.unwrap(), a);

        tokio::time::advance(LEASE).await;
        assert_eq!(driver.attempt_acquire_lease(&actor, b, LEASE).await.unwrap(), b);

        driver.heal(a);
        assert!(!driver.extend_lease(&actor, a, LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_actor_does_not_overwrite() {
        let actor = ActorId::from("a1");
        let driver = driver_with_actor(&actor);
        assert!(!driver.create_actor(
            &actor,
            ActorMetadata {
                name: "other".to_string(),
                key: vec![],
            }
        ));

        let grant = driver
            .start_and_acquire_lease(&actor, NodeId::new(), LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.metadata.name, "counter");
    }
}
