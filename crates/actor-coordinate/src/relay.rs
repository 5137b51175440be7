//! Client connections terminated on this node and relayed to the leader.
//!
//! A [`RelayConn`] is the follower half of a connection: it owns the client
//! transport, holds a reference on the actor's peer, and forwards traffic
//! to whichever node leads the actor. The leader half lives inside the
//! actor and is reached through `LeaderConnOpen` / `LeaderMsg` /
//! `LeaderConnClose`.
//!
//! The leader may be this same node; messages then loop back through the
//! driver like any other.

use crate::errors::CoordinateError;
use crate::node::publish_message_to_leader;
use crate::observability::metrics;
use crate::peer::ActorPeer;
use crate::protocol::{LeaderConnClose, LeaderConnOpen, LeaderMsg, NodeMessageBody, WsPayload};
use crate::runtime::{lock, CoordinateRuntime};
use crate::token::generate_conn_token;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::{ActorId, ConnId, NodeId};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Outbound side of a client connection (WebSocket or SSE stream).
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send_message(&self, message: Value) -> Result<(), CoordinateError>;

    async fn disconnect(&self, reason: Option<String>) -> Result<(), CoordinateError>;
}

/// Client end of a raw WebSocket relayed to an actor.
#[async_trait]
pub trait ClientWebSocket: Send + Sync {
    async fn send(&self, payload: WsPayload) -> Result<(), CoordinateError>;

    async fn close(&self, code: Option<u16>, reason: Option<String>)
        -> Result<(), CoordinateError>;
}

pub struct RelayConn {
    runtime: Arc<CoordinateRuntime>,
    conn_id: ConnId,
    conn_token: SecretString,
    actor_id: ActorId,
    params: Value,
    auth_data: Value,
    transport: Arc<dyn RelayTransport>,
    peer: OnceLock<Arc<ActorPeer>>,
    /// Leader that acknowledged the open. Messages wait for it.
    opened_on: watch::Sender<Option<NodeId>>,
    /// Cancels in-flight publishes once the connection goes away.
    cancel: CancellationToken,
    disconnected: AtomicBool,
}

impl RelayConn {
    /// Create an unstarted connection with a fresh id and token.
    ///
    /// # Errors
    ///
    /// Returns `CoordinateError::Internal` if no token can be generated.
    pub fn new(
        runtime: Arc<CoordinateRuntime>,
        transport: Arc<dyn RelayTransport>,
        actor_id: ActorId,
        params: Value,
        auth_data: Value,
    ) -> Result<Arc<Self>, CoordinateError> {
        Ok(Arc::new(Self {
            runtime,
            conn_id: ConnId::new(),
            conn_token: generate_conn_token()?,
            actor_id,
            params,
            auth_data,
            transport,
            peer: OnceLock::new(),
            opened_on: watch::Sender::new(None),
            cancel: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        }))
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Capability the client presents when it sends through another path.
    pub fn conn_token(&self) -> &SecretString {
        &self.conn_token
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    pub fn opened_on(&self) -> Option<NodeId> {
        *self.opened_on.borrow()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Join the actor and open the connection on its leader.
    ///
    /// # Errors
    ///
    /// Acquire or delivery failures. The connection is already cleaned up
    /// (transport closed, reference dropped) when this returns an error.
    #[instrument(skip_all, fields(actor_id = %self.actor_id, conn_id = %self.conn_id))]
    pub async fn start(self: &Arc<Self>) -> Result<(), CoordinateError> {
        let peer = match ActorPeer::acquire(&self.runtime, &self.actor_id, self.conn_id).await {
            Ok(peer) => peer,
            Err(e) => {
                self.disconnect(true, Some(e.client_message())).await;
                return Err(e);
            }
        };
        if self.peer.set(peer).is_err() {
            return Err(CoordinateError::Internal(
                "relay connection started twice".to_string(),
            ));
        }

        {
            let mut conns = lock(&self.runtime.relay_conns);
            conns.insert(self.conn_id, Arc::clone(self));
            metrics::set_relay_conns_active(conns.len());
        }

        let body = NodeMessageBody::LeaderConnOpen(LeaderConnOpen {
            actor_id: self.actor_id.clone(),
            conn_id: self.conn_id,
            conn_token: self.conn_token.expose_secret().to_string(),
            params: self.params.clone(),
            auth_data: self.auth_data.clone(),
        });

        match publish_message_to_leader(&self.runtime, &self.actor_id, body, Some(&self.cancel))
            .await
        {
            Ok(leader) => {
                self.opened_on.send_replace(Some(leader));
                debug!(
                    target: "coordinate.relay",
                    actor_id = %self.actor_id,
                    conn_id = %self.conn_id,
                    leader_node_id = %leader,
                    "Relay connection opened"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "coordinate.relay",
                    actor_id = %self.actor_id,
                    conn_id = %self.conn_id,
                    error = %e,
                    "Failed to open connection on leader"
                );
                self.disconnect(true, Some(e.client_message())).await;
                Err(e)
            }
        }
    }

    /// Deliver a message from the leader to the client.
    pub async fn on_message(&self, message: Value) {
        if self.is_disconnected() {
            return;
        }
        if let Err(e) = self.transport.send_message(message).await {
            debug!(
                target: "coordinate.relay",
                conn_id = %self.conn_id,
                error = %e,
                "Failed to deliver message to client"
            );
        }
    }

    /// Forward a client message to the leader.
    ///
    /// # Errors
    ///
    /// `CoordinateError::ConnNotReady` after disconnect, otherwise delivery errors.
    pub async fn send_to_leader(&self, message: Value) -> Result<(), CoordinateError> {
        if self.is_disconnected() || !self.wait_opened().await {
            return Err(CoordinateError::ConnNotReady);
        }
        let body = NodeMessageBody::LeaderMsg(LeaderMsg {
            actor_id: self.actor_id.clone(),
            conn_id: self.conn_id,
            conn_token: self.conn_token.expose_secret().to_string(),
            message,
        });
        publish_message_to_leader(&self.runtime, &self.actor_id, body, Some(&self.cancel)).await?;
        Ok(())
    }

    /// Wait until the leader has acknowledged the open. False if the
    /// connection goes away first.
    async fn wait_opened(&self) -> bool {
        let mut opened = self.opened_on.subscribe();
        tokio::select! {
            result = opened.wait_for(Option::is_some) => result.is_ok(),
            () = self.cancel.cancelled() => false,
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// `from_leader` means the leader already knows (it initiated the close,
    /// or it is gone), so no `LeaderConnClose` is sent.
    #[instrument(skip_all, fields(actor_id = %self.actor_id, conn_id = %self.conn_id))]
    pub async fn disconnect(self: &Arc<Self>, from_leader: bool, reason: Option<String>) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        if let Err(e) = self.transport.disconnect(reason).await {
            debug!(
                target: "coordinate.relay",
                conn_id = %self.conn_id,
                error = %e,
                "Transport failed to disconnect"
            );
        }

        {
            let mut conns = lock(&self.runtime.relay_conns);
            if conns
                .get(&self.conn_id)
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                conns.remove(&self.conn_id);
            }
            metrics::set_relay_conns_active(conns.len());
        }

        let Some(peer) = self.peer.get() else {
            return;
        };

        if !from_leader {
            let body = NodeMessageBody::LeaderConnClose(LeaderConnClose {
                actor_id: self.actor_id.clone(),
                conn_id: self.conn_id,
            });
            if let Err(e) = publish_message_to_leader(&self.runtime, &self.actor_id, body, None).await
            {
                warn!(
                    target: "coordinate.relay",
                    actor_id = %self.actor_id,
                    conn_id = %self.conn_id,
                    error = %e,
                    "Failed to tell leader about closed connection"
                );
            }
        }

        peer.remove_reference(self.conn_id).await;
        debug!(
            target: "coordinate.relay",
            conn_id = %self.conn_id,
            from_leader = from_leader,
            "Relay connection closed"
        );
    }
}

impl std::fmt::Debug for RelayConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConn")
            .field("conn_id", &self.conn_id)
            .field("actor_id", &self.actor_id)
            .field("conn_token", &"[REDACTED]")
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}
