//! Multi-node clusters for integration tests.
//!
//! Every node is a full [`CoordinateRuntime`] with its own
//! [`MockActorFactory`]; all of them share one [`MemoryCoordinateDriver`], so
//! the cluster behaves like several processes talking to one Redis.

use crate::mock_actor::MockActorFactory;
use actor_coordinate::config::ActorPeerConfig;
use actor_coordinate::driver::{ActorMetadata, MemoryCoordinateDriver};
use actor_coordinate::CoordinateRuntime;
use common::types::ActorId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One node of a [`TestCluster`].
pub struct TestNode {
    pub runtime: Arc<CoordinateRuntime>,
    pub actors: MockActorFactory,
}

pub struct TestCluster {
    pub driver: MemoryCoordinateDriver,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `size` nodes with default timing.
    pub async fn start(size: usize) -> Self {
        Self::start_with_config(size, ActorPeerConfig::default()).await
    }

    pub async fn start_with_config(size: usize, config: ActorPeerConfig) -> Self {
        let driver = MemoryCoordinateDriver::new();
        let mut nodes = Vec::with_capacity(size);
        for _ in 0..size {
            let actors = MockActorFactory::new();
            let runtime = CoordinateRuntime::start(
                Arc::new(driver.clone()),
                Arc::new(actors.clone()),
                config.clone(),
            )
            .await
            .expect("runtime failed to start");
            nodes.push(TestNode { runtime, actors });
        }
        Self { driver, nodes }
    }

    /// Add a node whose actor factory always fails.
    pub async fn add_failing_node(&mut self) -> usize {
        self.add_node(MockActorFactory::failing()).await
    }

    /// Add a node with default timing and the given actors. Returns its index.
    pub async fn add_node(&mut self, actors: MockActorFactory) -> usize {
        let runtime = CoordinateRuntime::start(
            Arc::new(self.driver.clone()),
            Arc::new(actors.clone()),
            ActorPeerConfig::default(),
        )
        .await
        .expect("runtime failed to start");
        self.nodes.push(TestNode { runtime, actors });
        self.nodes.len() - 1
    }

    pub fn node(&self, index: usize) -> &TestNode {
        self.nodes
            .get(index)
            .unwrap_or_else(|| panic!("cluster has no node {index}"))
    }

    /// Record an actor in the backend so nodes can elect a leader for it.
    pub fn create_actor(&self, id: &str) -> ActorId {
        let actor_id = ActorId::from(id);
        self.driver.create_actor(
            &actor_id,
            ActorMetadata {
                name: "mock".to_string(),
                key: vec![id.to_string()],
            },
        );
        actor_id
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.runtime.shutdown().await;
        }
    }
}

/// Poll `condition` every 10ms until it holds. Panics after 10s.
///
/// Under a paused clock the sleeps let background tasks run and advance
/// virtual time.
pub async fn eventually<F>(description: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {description}");
}

/// Await `future` for at most 60s of (possibly virtual) time.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(60), future)
        .await
        .expect("operation did not complete in time")
}

/// Install a tracing subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
