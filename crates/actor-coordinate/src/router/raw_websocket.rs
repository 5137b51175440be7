use super::RawWebSocketOpts;
use crate::errors::CoordinateError;
use crate::node::{publish_message_to_leader, publish_message_to_leader_no_retry};
use crate::peer::ActorPeer;
use crate::protocol::{LeaderWsOpen, NodeMessageBody, WsClose, WsFrame, WsPayload};
use crate::relay::ClientWebSocket;
use crate::runtime::{lock, CoordinateRuntime, RelayWebSocket};
use common::types::{ActorId, ConnId, WebSocketId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const CLOSE_SERVICE_RESTART: u16 = 1012;

/// A raw WebSocket handed to the actor's own websocket handler.
///
/// Frames go out with a single delivery attempt so they cannot be
/// reordered by retries. If the leader cannot be reached the socket is
/// closed and the client is expected to reconnect.
pub struct RawWebSocketSession {
    runtime: Arc<CoordinateRuntime>,
    actor_id: ActorId,
    websocket_id: WebSocketId,
    socket: Arc<dyn ClientWebSocket>,
    peer: Arc<ActorPeer>,
    reference: ConnId,
    closed: AtomicBool,
}

impl RawWebSocketSession {
    #[instrument(skip_all, fields(actor_id = %opts.actor_id))]
    pub(super) async fn open(
        runtime: Arc<CoordinateRuntime>,
        opts: RawWebSocketOpts,
        socket: Arc<dyn ClientWebSocket>,
    ) -> Result<Self, CoordinateError> {
        let reference = ConnId::new();
        let peer = ActorPeer::acquire(&runtime, &opts.actor_id, reference).await?;
        let websocket_id = WebSocketId::new();

        lock(&runtime.relay_websockets).insert(
            websocket_id,
            RelayWebSocket {
                actor_id: opts.actor_id.clone(),
                socket: Arc::clone(&socket),
            },
        );

        let body = NodeMessageBody::LeaderWsOpen(LeaderWsOpen {
            actor_id: opts.actor_id.clone(),
            websocket_id,
            url: opts.url,
            headers: opts.headers,
            auth_data: opts.auth_data,
        });
        if let Err(e) = publish_message_to_leader(&runtime, &opts.actor_id, body, None).await {
            warn!(
                target: "coordinate.router",
                actor_id = %opts.actor_id,
                websocket_id = %websocket_id,
                error = %e,
                "Failed to open websocket on leader"
            );
            lock(&runtime.relay_websockets).remove(&websocket_id);
            peer.remove_reference(reference).await;
            return Err(e);
        }

        Ok(Self {
            runtime,
            actor_id: opts.actor_id,
            websocket_id,
            socket,
            peer,
            reference,
            closed: AtomicBool::new(false),
        })
    }

    pub fn websocket_id(&self) -> WebSocketId {
        self.websocket_id
    }

    /// Forward a client frame to the actor.
    ///
    /// # Errors
    ///
    /// `CoordinateError::LeaderChanged` if the leader could not be reached;
    /// the client socket has been closed with 1012 in that case.
    pub async fn on_message(&self, payload: WsPayload) -> Result<(), CoordinateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinateError::ConnNotReady);
        }
        let body = NodeMessageBody::LeaderWsMsg(WsFrame::new(self.websocket_id, &payload));
        match publish_message_to_leader_no_retry(&self.runtime, &self.actor_id, body, None).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(
                    target: "coordinate.router",
                    actor_id = %self.actor_id,
                    websocket_id = %self.websocket_id,
                    error = %e,
                    "Closing websocket after failed frame delivery"
                );
                lock(&self.runtime.relay_websockets).remove(&self.websocket_id);
                if let Err(close_err) = self
                    .socket
                    .close(Some(CLOSE_SERVICE_RESTART), Some(e.client_message()))
                    .await
                {
                    debug!(
                        target: "coordinate.router",
                        websocket_id = %self.websocket_id,
                        error = %close_err,
                        "Failed to close client websocket"
                    );
                }
                Err(e)
            }
        }
    }

    /// The client went away. Idempotent.
    pub async fn on_close(&self, code: Option<u16>, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let still_open = lock(&self.runtime.relay_websockets)
            .remove(&self.websocket_id)
            .is_some();
        if still_open {
            let body = NodeMessageBody::LeaderWsClose(WsClose {
                websocket_id: self.websocket_id,
                code,
                reason,
            });
            if let Err(e) =
                publish_message_to_leader(&self.runtime, &self.actor_id, body, None).await
            {
                warn!(
                    target: "coordinate.router",
                    actor_id = %self.actor_id,
                    websocket_id = %self.websocket_id,
                    error = %e,
                    "Failed to tell leader about closed websocket"
                );
            }
        }

        self.peer.remove_reference(self.reference).await;
    }
}
