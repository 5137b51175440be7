//! Per-node coordination runtime.
//!
//! A [`CoordinateRuntime`] owns everything one node needs: its id, the
//! driver, the actor factory, the registries of peers and relayed
//! connections, and the tables of pending acknowledgements and responses.
//! Several runtimes can share one process (and one driver) without
//! interfering, which is how the integration tests build clusters.
//!
//! # Locking
//!
//! Every table sits behind its own `std::sync::Mutex`. Guards are never held
//! across an `.await`; code clones what it needs out of a table and releases
//! the guard before doing I/O.

use crate::actor::ActorFactory;
use crate::config::ActorPeerConfig;
use crate::driver::CoordinateDriver;
use crate::errors::CoordinateError;
use crate::node;
use crate::peer::ActorPeer;
use crate::protocol::{FollowerActionResp, FollowerFetchResp};
use crate::relay::{ClientWebSocket, RelayConn};
use crate::router::ConnectionHandlers;
use common::types::{ActorId, ConnId, MessageId, NodeId, RequestId, WebSocketId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const CLOSE_SERVICE_RESTART: u16 = 1012;

/// Lock a table, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Leader-side record of a raw WebSocket relayed from a follower.
#[derive(Debug, Clone)]
pub(crate) struct LeaderWebSocket {
    pub actor_id: ActorId,
    pub follower: NodeId,
}

/// Follower-side record of a raw WebSocket whose actor lives elsewhere.
#[derive(Clone)]
pub(crate) struct RelayWebSocket {
    pub actor_id: ActorId,
    pub socket: Arc<dyn ClientWebSocket>,
}

pub struct CoordinateRuntime {
    node_id: NodeId,
    config: ActorPeerConfig,
    driver: Arc<dyn CoordinateDriver>,
    actor_factory: Arc<dyn ActorFactory>,

    pub(crate) actor_peers: Mutex<HashMap<ActorId, Arc<ActorPeer>>>,
    pub(crate) relay_conns: Mutex<HashMap<ConnId, Arc<RelayConn>>>,
    pub(crate) ack_resolvers: Mutex<HashMap<MessageId, oneshot::Sender<()>>>,
    pub(crate) action_resolvers: Mutex<HashMap<RequestId, oneshot::Sender<FollowerActionResp>>>,
    pub(crate) fetch_resolvers: Mutex<HashMap<RequestId, oneshot::Sender<FollowerFetchResp>>>,
    pub(crate) leader_websockets: Mutex<HashMap<WebSocketId, LeaderWebSocket>>,
    pub(crate) relay_websockets: Mutex<HashMap<WebSocketId, RelayWebSocket>>,

    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinateRuntime {
    /// Subscribe to this node's channel and start dispatching.
    ///
    /// The returned runtime keeps background tasks alive (the dispatcher and
    /// one heartbeat per actor peer). Call [`Self::shutdown`] to stop them.
    ///
    /// # Errors
    ///
    /// Returns `CoordinateError::Config` for an invalid configuration and
    /// `CoordinateError::Driver` if the subscription cannot be created.
    #[instrument(skip_all)]
    pub async fn start(
        driver: Arc<dyn CoordinateDriver>,
        actor_factory: Arc<dyn ActorFactory>,
        config: ActorPeerConfig,
    ) -> Result<Arc<Self>, CoordinateError> {
        config.validate()?;

        let node_id = NodeId::new();
        let subscriber = driver.create_node_subscriber(node_id).await?;

        let runtime = Arc::new(Self {
            node_id,
            config,
            driver,
            actor_factory,
            actor_peers: Mutex::new(HashMap::new()),
            relay_conns: Mutex::new(HashMap::new()),
            ack_resolvers: Mutex::new(HashMap::new()),
            action_resolvers: Mutex::new(HashMap::new()),
            fetch_resolvers: Mutex::new(HashMap::new()),
            leader_websockets: Mutex::new(HashMap::new()),
            relay_websockets: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(node::run_dispatcher(
            Arc::downgrade(&runtime),
            subscriber,
            runtime.shutdown.clone(),
        ));
        *lock(&runtime.dispatcher) = Some(handle);

        info!(
            target: "coordinate.runtime",
            node_id = %node_id,
            "Coordinate runtime started"
        );

        Ok(runtime)
    }

    /// Stop this node gracefully.
    ///
    /// Relay connections are closed (telling their leaders), every peer is
    /// disposed with its lease released so another node can take over
    /// without waiting for expiry, and finally the dispatcher stops.
    #[instrument(skip_all, fields(node_id = %self.node_id))]
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let conns: Vec<Arc<RelayConn>> = lock(&self.relay_conns).values().cloned().collect();
        for conn in conns {
            let close = conn.disconnect(false, Some("node shutting down".to_string()));
            if tokio::time::timeout(self.config.lease_duration, close)
                .await
                .is_err()
            {
                warn!(
                    target: "coordinate.runtime",
                    conn_id = %conn.conn_id(),
                    "Timed out closing relay connection during shutdown"
                );
            }
        }

        let peers: Vec<Arc<ActorPeer>> = lock(&self.actor_peers).values().cloned().collect();
        for peer in peers {
            peer.dispose(true).await;
        }

        self.shutdown.cancel();

        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    target: "coordinate.runtime",
                    error = %e,
                    "Node dispatcher task failed"
                );
            }
        }

        info!(
            target: "coordinate.runtime",
            node_id = %self.node_id,
            "Coordinate runtime stopped"
        );
    }

    /// Stop serving after the node lost its subscription.
    ///
    /// Nothing addressed to this node can arrive any more, so it must not
    /// keep leading. Local clients are cut off without telling their
    /// leaders (no acknowledgement could come back) and every peer is
    /// disposed so its lease goes to another node. Further acquires fail.
    #[instrument(skip_all, fields(node_id = %self.node_id))]
    pub(crate) async fn halt(&self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        error!(
            target: "coordinate.runtime",
            node_id = %self.node_id,
            reason = reason,
            "Coordinate runtime halted"
        );

        let conns: Vec<Arc<RelayConn>> = lock(&self.relay_conns).values().cloned().collect();
        for conn in conns {
            conn.disconnect(true, Some(reason.to_string())).await;
        }

        let sockets: Vec<RelayWebSocket> = lock(&self.relay_websockets)
            .drain()
            .map(|(_, socket)| socket)
            .collect();
        for relayed in sockets {
            if let Err(e) = relayed
                .socket
                .close(Some(CLOSE_SERVICE_RESTART), Some(reason.to_string()))
                .await
            {
                warn!(
                    target: "coordinate.runtime",
                    actor_id = %relayed.actor_id,
                    error = %e,
                    "Failed to close relayed websocket"
                );
            }
        }

        let peers: Vec<Arc<ActorPeer>> = lock(&self.actor_peers).values().cloned().collect();
        for peer in peers {
            peer.dispose(true).await;
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ActorPeerConfig {
        &self.config
    }

    /// Entry points for the transport layer.
    pub fn handlers(self: &Arc<Self>) -> ConnectionHandlers {
        ConnectionHandlers::new(Arc::clone(self))
    }

    /// The local peer for `actor_id`, if this node currently holds one.
    pub fn actor_peer(&self, actor_id: &ActorId) -> Option<Arc<ActorPeer>> {
        lock(&self.actor_peers).get(actor_id).cloned()
    }

    pub fn actor_peer_count(&self) -> usize {
        lock(&self.actor_peers).len()
    }

    pub fn relay_conn(&self, conn_id: ConnId) -> Option<Arc<RelayConn>> {
        lock(&self.relay_conns).get(&conn_id).cloned()
    }

    pub fn relay_conn_count(&self) -> usize {
        lock(&self.relay_conns).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn CoordinateDriver> {
        &self.driver
    }

    pub(crate) fn actor_factory(&self) -> &Arc<dyn ActorFactory> {
        &self.actor_factory
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl std::fmt::Debug for CoordinateRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinateRuntime")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("actor_peers", &self.actor_peer_count())
            .field("relay_conns", &self.relay_conn_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actor::LeaderActor;
    use crate::driver::{ActorMetadata, MemoryCoordinateDriver};
    use crate::errors::ActorError;
    use std::time::Duration;

    struct NoActors;

    impl ActorFactory for NoActors {
        fn instantiate(
            &self,
            _actor_id: &ActorId,
            _metadata: &ActorMetadata,
        ) -> Result<Arc<dyn LeaderActor>, ActorError> {
            Err(ActorError::internal("no actors in this test"))
        }
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = ActorPeerConfig {
            renew_lease_grace: Duration::from_millis(5000),
            ..ActorPeerConfig::default()
        };
        let result = CoordinateRuntime::start(
            Arc::new(MemoryCoordinateDriver::new()),
            Arc::new(NoActors),
            config,
        )
        .await;
        assert!(matches!(result, Err(CoordinateError::Config(_))));
    }

    #[tokio::test]
    async fn test_runtimes_get_distinct_node_ids() {
        let driver = Arc::new(MemoryCoordinateDriver::new());
        let a = CoordinateRuntime::start(driver.clone(), Arc::new(NoActors), ActorPeerConfig::default())
            .await
            .unwrap();
        let b = CoordinateRuntime::start(driver, Arc::new(NoActors), ActorPeerConfig::default())
            .await
            .unwrap();

        assert_ne!(a.node_id(), b.node_id());
        assert_eq!(a.actor_peer_count(), 0);
        assert_eq!(b.relay_conn_count(), 0);

        a.shutdown().await;
        b.shutdown().await;
        assert!(a.is_shut_down());
    }

    #[tokio::test]
    async fn test_lost_subscription_halts_runtime() {
        let driver = MemoryCoordinateDriver::new();
        let runtime = CoordinateRuntime::start(
            Arc::new(driver.clone()),
            Arc::new(NoActors),
            ActorPeerConfig::default(),
        )
        .await
        .unwrap();

        driver.close_subscription(runtime.node_id());
        for _ in 0..100 {
            if runtime.is_shut_down() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(runtime.is_shut_down());
        let handle = lock(&runtime.dispatcher).take().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let runtime = CoordinateRuntime::start(
            Arc::new(MemoryCoordinateDriver::new()),
            Arc::new(NoActors),
            ActorPeerConfig::default(),
        )
        .await
        .unwrap();

        runtime.shutdown().await;
        runtime.shutdown().await;
        assert!(runtime.is_shut_down());
    }
}
