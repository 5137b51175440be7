//! Per-actor leadership state on one node.
//!
//! An [`ActorPeer`] exists on a node while at least one local connection
//! (or in-flight request) references its actor. It tracks who leads the
//! actor, hosts the actor instance when this node is leader, and runs the
//! lease heartbeat:
//!
//! ```text
//! acquire ──► Starting ──► Follower ──(lease free)──► Leader
//!                 │            │                        │
//!                 └────────────┴──── dispose ◄──────────┘
//!                                       (last reference removed,
//!                                        lease renewal failed,
//!                                        node shutdown)
//! ```
//!
//! Disposal is terminal. A disposed peer is removed from the registry and
//! the next `acquire` creates a fresh one.

use crate::actor::{ConnDriver, LeaderActor};
use crate::driver::ActorMetadata;
use crate::errors::CoordinateError;
use crate::node::{send_unacked, LeaderConnDriver};
use crate::observability::metrics;
use crate::protocol::{NodeMessageBody, WsClose};
use crate::relay::RelayConn;
use crate::runtime::{lock, CoordinateRuntime};
use common::types::{ActorId, ConnId, NodeId, WebSocketId};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

const CLOSE_SERVICE_RESTART: u16 = 1012;

#[derive(Default)]
struct PeerState {
    leader_node_id: Option<NodeId>,
    metadata: Option<ActorMetadata>,
    references: HashSet<ConnId>,
    /// When the lease was last acquired or extended by this node. The lease
    /// is assumed gone `lease_duration` after it.
    lease_renewed_at: Option<Instant>,
    disposed: bool,
}

pub struct ActorPeer {
    runtime: Arc<CoordinateRuntime>,
    actor_id: ActorId,
    state: Mutex<PeerState>,
    /// Completes once the lease has been read and the heartbeat scheduled.
    started: OnceCell<()>,
    /// Loaded actor, leader only.
    actor: OnceCell<Arc<dyn LeaderActor>>,
    /// Cancelled at disposal. Stops the heartbeat and outbound actor messages.
    lifecycle: CancellationToken,
}

impl ActorPeer {
    fn new(runtime: Arc<CoordinateRuntime>, actor_id: ActorId) -> Self {
        Self {
            runtime,
            actor_id,
            state: Mutex::new(PeerState::default()),
            started: OnceCell::new(),
            actor: OnceCell::new(),
            lifecycle: CancellationToken::new(),
        }
    }

    /// Get or create the local peer for `actor_id`, wait for it to start,
    /// and register `conn_id` as a reference.
    ///
    /// Concurrent callers for the same actor share one peer and one start.
    ///
    /// # Errors
    ///
    /// - `CoordinateError::ActorNotFound` if the actor was never created
    /// - `CoordinateError::Driver` if the backend is unreachable
    /// - Any error from instantiating or starting the actor when this node
    ///   wins the lease
    #[instrument(skip_all, fields(actor_id = %actor_id, conn_id = %conn_id))]
    pub async fn acquire(
        runtime: &Arc<CoordinateRuntime>,
        actor_id: &ActorId,
        conn_id: ConnId,
    ) -> Result<Arc<Self>, CoordinateError> {
        loop {
            if runtime.is_shut_down() {
                return Err(CoordinateError::Cancelled);
            }
            let peer = {
                let mut peers = lock(&runtime.actor_peers);
                if let Some(peer) = peers.get(actor_id) {
                    Arc::clone(peer)
                } else {
                    let peer = Arc::new(Self::new(Arc::clone(runtime), actor_id.clone()));
                    peers.insert(actor_id.clone(), Arc::clone(&peer));
                    metrics::set_actor_peers_active(peers.len());
                    peer
                }
            };

            match peer.ensure_started().await {
                Ok(()) => {}
                Err(CoordinateError::PeerDisposed(_)) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            if peer.add_reference(conn_id) {
                return Ok(peer);
            }

            // Disposed between start and reference; it is already out of the registry.
            trace!(
                target: "coordinate.peer",
                actor_id = %actor_id,
                "Peer disposed during acquire, retrying"
            );
            tokio::task::yield_now().await;
        }
    }

    /// The started local actor if this node leads `actor_id`.
    ///
    /// Waits for an in-flight start. `None` when there is no local peer, the
    /// peer is a follower, or the actor failed to load.
    pub async fn get_leader_actor(
        runtime: &CoordinateRuntime,
        actor_id: &ActorId,
    ) -> Option<Arc<dyn LeaderActor>> {
        let peer = runtime.actor_peer(actor_id)?;
        peer.leader_actor().await
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Cached leader; may briefly lag the backend.
    pub fn leader_node_id(&self) -> Option<NodeId> {
        lock(&self.state).leader_node_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader_node_id() == Some(self.runtime.node_id())
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    pub fn reference_count(&self) -> usize {
        lock(&self.state).references.len()
    }

    /// Drop one reference; disposes the peer (releasing the lease) when it
    /// was the last.
    #[instrument(skip_all, fields(actor_id = %self.actor_id, conn_id = %conn_id))]
    pub async fn remove_reference(self: &Arc<Self>, conn_id: ConnId) {
        let dispose = {
            let mut state = lock(&self.state);
            if !state.references.remove(&conn_id) {
                warn!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    conn_id = %conn_id,
                    "Removing reference that does not exist"
                );
            }
            if state.references.is_empty() && !state.disposed {
                state.disposed = true;
                true
            } else {
                false
            }
        };

        if dispose {
            self.finish_dispose(true).await;
        }
    }

    /// Tear the peer down. Idempotent.
    ///
    /// With `release`, a leader gives its lease back so another node can
    /// take over immediately; without it the lease is left to expire.
    #[instrument(skip_all, fields(actor_id = %self.actor_id, release = release))]
    pub async fn dispose(self: &Arc<Self>, release: bool) {
        {
            let mut state = lock(&self.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        self.finish_dispose(release).await;
    }

    async fn finish_dispose(self: &Arc<Self>, release: bool) {
        // Must happen before the first await so no heartbeat tick can run after disposal.
        self.lifecycle.cancel();

        {
            let mut peers = lock(&self.runtime.actor_peers);
            if peers
                .get(&self.actor_id)
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                peers.remove(&self.actor_id);
            }
            metrics::set_actor_peers_active(peers.len());
        }

        let was_leader = self.is_leader();
        debug!(
            target: "coordinate.peer",
            actor_id = %self.actor_id,
            was_leader = was_leader,
            release = release,
            "Disposing actor peer"
        );

        if !was_leader {
            return;
        }

        self.close_leader_websockets().await;

        if let Some(actor) = self.actor.get() {
            if let Err(e) = actor.stop().await {
                warn!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    error = %e,
                    "Actor failed to stop cleanly"
                );
            }
        }

        if release {
            if let Err(e) = self
                .runtime
                .driver()
                .release_lease(&self.actor_id, self.runtime.node_id())
                .await
            {
                warn!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    error = %e,
                    "Failed to release lease, it will expire on its own"
                );
            }
        }
    }

    /// Tell followers to close raw WebSockets relayed to this actor.
    async fn close_leader_websockets(&self) {
        let sockets: Vec<(WebSocketId, NodeId)> = {
            let mut table = lock(&self.runtime.leader_websockets);
            let ids: Vec<WebSocketId> = table
                .iter()
                .filter(|(_, socket)| socket.actor_id == self.actor_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(&id).map(|socket| (id, socket.follower)))
                .collect()
        };

        for (websocket_id, follower) in sockets {
            send_unacked(
                &self.runtime,
                follower,
                NodeMessageBody::FollowerWsClose(WsClose {
                    websocket_id,
                    code: Some(CLOSE_SERVICE_RESTART),
                    reason: Some("actor stopped".to_string()),
                }),
            )
            .await;
        }
    }

    fn add_reference(&self, conn_id: ConnId) -> bool {
        let mut state = lock(&self.state);
        if state.disposed {
            return false;
        }
        state.references.insert(conn_id);
        true
    }

    async fn ensure_started(self: &Arc<Self>) -> Result<(), CoordinateError> {
        if self.is_disposed() {
            return Err(CoordinateError::PeerDisposed(self.actor_id.clone()));
        }
        self.started.get_or_try_init(|| self.start()).await?;
        Ok(())
    }

    async fn start(self: &Arc<Self>) -> Result<(), CoordinateError> {
        if self.is_disposed() {
            return Err(CoordinateError::PeerDisposed(self.actor_id.clone()));
        }

        let node_id = self.runtime.node_id();
        let lease = self.runtime.config().lease_duration;
        let requested_at = Instant::now();
        let grant = match self
            .runtime
            .driver()
            .start_and_acquire_lease(&self.actor_id, node_id, lease)
            .await
        {
            Ok(Some(grant)) => grant,
            Ok(None) => {
                self.dispose(false).await;
                return Err(CoordinateError::ActorNotFound(self.actor_id.clone()));
            }
            Err(e) => {
                self.dispose(false).await;
                return Err(e);
            }
        };

        let leader = grant.leader_node_id;
        {
            let mut state = lock(&self.state);
            state.metadata = Some(grant.metadata);
            state.leader_node_id = Some(leader);
            if leader == node_id {
                state.lease_renewed_at = Some(requested_at);
            }
        }

        debug!(
            target: "coordinate.peer",
            actor_id = %self.actor_id,
            leader_node_id = %leader,
            is_leader = leader == node_id,
            "Actor peer started"
        );

        if leader == node_id {
            if let Err(e) = self.convert_to_leader("start").await {
                warn!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    error = %e,
                    "Failed to start actor as leader"
                );
                self.dispose(true).await;
                return Err(e);
            }
        }

        self.spawn_heartbeat();
        Ok(())
    }

    async fn leader_actor(self: &Arc<Self>) -> Option<Arc<dyn LeaderActor>> {
        if let Err(e) = self.ensure_started().await {
            debug!(
                target: "coordinate.peer",
                actor_id = %self.actor_id,
                error = %e,
                "Peer is not available"
            );
            return None;
        }
        if self.is_disposed() || !self.is_leader() {
            return None;
        }
        match self.ensure_actor().await {
            Ok(actor) => Some(actor),
            Err(e) => {
                warn!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    error = %e,
                    "Failed to load leader actor"
                );
                None
            }
        }
    }

    async fn convert_to_leader(self: &Arc<Self>, reason: &'static str) -> Result<(), CoordinateError> {
        info!(
            target: "coordinate.peer",
            actor_id = %self.actor_id,
            node_id = %self.runtime.node_id(),
            reason = reason,
            "Became actor leader"
        );
        self.ensure_actor().await?;
        metrics::record_leader_promotion(reason);
        Ok(())
    }

    /// Instantiate and start the actor exactly once.
    async fn ensure_actor(self: &Arc<Self>) -> Result<Arc<dyn LeaderActor>, CoordinateError> {
        let actor = self
            .actor
            .get_or_try_init(|| async {
                let metadata = lock(&self.state).metadata.clone().ok_or_else(|| {
                    CoordinateError::Internal("actor metadata not loaded".to_string())
                })?;

                let actor = self
                    .runtime
                    .actor_factory()
                    .instantiate(&self.actor_id, &metadata)?;
                let conn_driver: Arc<dyn ConnDriver> = Arc::new(LeaderConnDriver::new(
                    Arc::clone(&self.runtime),
                    self.actor_id.clone(),
                    self.lifecycle.clone(),
                ));
                actor.start(conn_driver, &self.actor_id, &metadata).await?;
                Ok::<_, CoordinateError>(actor)
            })
            .await?;
        Ok(Arc::clone(actor))
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = peer.next_heartbeat_delay();
                tokio::select! {
                    () = peer.lifecycle.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                peer.heartbeat().await;
            }
            trace!(
                target: "coordinate.peer",
                actor_id = %peer.actor_id,
                "Heartbeat stopped"
            );
        });
    }

    fn next_heartbeat_delay(&self) -> Duration {
        let config = self.runtime.config();
        if self.is_leader() {
            config.renew_interval()
        } else {
            config.check_lease_interval + jitter(config.check_lease_jitter)
        }
    }

    async fn heartbeat(self: &Arc<Self>) {
        if self.is_leader() {
            self.extend_lease().await;
        } else {
            self.check_lease().await;
        }
    }

    async fn extend_lease(self: &Arc<Self>) {
        let requested_at = Instant::now();
        let result = self
            .runtime
            .driver()
            .extend_lease(
                &self.actor_id,
                self.runtime.node_id(),
                self.runtime.config().lease_duration,
            )
            .await;

        match result {
            Ok(true) => {
                lock(&self.state).lease_renewed_at = Some(requested_at);
                trace!(target: "coordinate.peer", actor_id = %self.actor_id, "Lease extended");
            }
            Ok(false) => {
                warn!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    "Lost actor lease, disposing"
                );
                self.step_down().await;
            }
            Err(e) => {
                let renewed_at = lock(&self.state).lease_renewed_at;
                let expired = match renewed_at {
                    Some(at) => at.elapsed() >= self.runtime.config().lease_duration,
                    None => true,
                };
                if expired {
                    warn!(
                        target: "coordinate.peer",
                        actor_id = %self.actor_id,
                        error = %e,
                        "Lease expired while the backend was unreachable, disposing"
                    );
                    self.step_down().await;
                } else {
                    warn!(
                        target: "coordinate.peer",
                        actor_id = %self.actor_id,
                        error = %e,
                        "Failed to extend lease"
                    );
                }
            }
        }
    }

    /// Stop leading without releasing: the lease already belongs to nobody
    /// or to another node.
    async fn step_down(self: &Arc<Self>) {
        metrics::record_lease_lost();
        self.disconnect_local(None);
        self.dispose(false).await;
    }

    async fn check_lease(self: &Arc<Self>) {
        let node_id = self.runtime.node_id();
        let requested_at = Instant::now();
        let leader = match self
            .runtime
            .driver()
            .attempt_acquire_lease(&self.actor_id, node_id, self.runtime.config().lease_duration)
            .await
        {
            Ok(leader) => leader,
            Err(e) => {
                warn!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    error = %e,
                    "Failed to check lease"
                );
                return;
            }
        };

        let previous = {
            let mut state = lock(&self.state);
            if leader == node_id {
                state.lease_renewed_at = Some(requested_at);
            }
            state.leader_node_id.replace(leader)
        };
        if previous == Some(leader) {
            return;
        }

        info!(
            target: "coordinate.peer",
            actor_id = %self.actor_id,
            previous_leader = ?previous,
            leader_node_id = %leader,
            "Actor leader changed"
        );

        self.disconnect_local(Some(leader));

        if leader == node_id {
            if let Err(e) = self.convert_to_leader("takeover").await {
                error!(
                    target: "coordinate.peer",
                    actor_id = %self.actor_id,
                    error = %e,
                    "Failed to take over actor, releasing lease"
                );
                self.dispose(true).await;
            }
        }
    }

    /// Close local relay connections and relayed raw WebSockets that talk to
    /// a leader other than `current_leader`, so their clients reconnect.
    ///
    /// Runs in the background; closing a connection may publish to nodes.
    fn disconnect_local(&self, current_leader: Option<NodeId>) {
        let conns: Vec<Arc<RelayConn>> = lock(&self.runtime.relay_conns)
            .values()
            .filter(|conn| conn.actor_id() == &self.actor_id)
            .filter(|conn| current_leader.is_none() || conn.opened_on() != current_leader)
            .cloned()
            .collect();

        let sockets: Vec<_> = {
            let mut relayed = lock(&self.runtime.relay_websockets);
            let ids: Vec<_> = relayed
                .iter()
                .filter(|(_, socket)| socket.actor_id == self.actor_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| relayed.remove(&id))
                .collect()
        };

        if conns.is_empty() && sockets.is_empty() {
            return;
        }

        let actor_id = self.actor_id.clone();
        tokio::spawn(async move {
            for conn in conns {
                conn.disconnect(true, Some("actor leader changed".to_string()))
                    .await;
            }
            for relayed in sockets {
                if let Err(e) = relayed
                    .socket
                    .close(
                        Some(CLOSE_SERVICE_RESTART),
                        Some("actor leader changed".to_string()),
                    )
                    .await
                {
                    debug!(
                        target: "coordinate.peer",
                        actor_id = %actor_id,
                        error = %e,
                        "Failed to close relayed websocket"
                    );
                }
            }
        });
    }
}

impl std::fmt::Debug for ActorPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ActorPeer")
            .field("actor_id", &self.actor_id)
            .field("leader_node_id", &state.leader_node_id)
            .field("references", &state.references.len())
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
