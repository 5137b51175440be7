//! Leader-side handle for a raw WebSocket whose client sits on a follower.

use super::send_unacked;
use crate::actor::ActorWebSocket;
use crate::errors::CoordinateError;
use crate::protocol::{NodeMessage, NodeMessageBody, WsClose, WsFrame, WsPayload};
use crate::runtime::{lock, CoordinateRuntime};
use async_trait::async_trait;
use common::types::{NodeId, WebSocketId};
use std::sync::Arc;

pub(crate) struct RelayedActorWebSocket {
    runtime: Arc<CoordinateRuntime>,
    websocket_id: WebSocketId,
    follower: NodeId,
}

impl RelayedActorWebSocket {
    pub(crate) fn new(
        runtime: Arc<CoordinateRuntime>,
        websocket_id: WebSocketId,
        follower: NodeId,
    ) -> Self {
        Self {
            runtime,
            websocket_id,
            follower,
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.runtime.leader_websockets).contains_key(&self.websocket_id)
    }
}

#[async_trait]
impl ActorWebSocket for RelayedActorWebSocket {
    fn id(&self) -> WebSocketId {
        self.websocket_id
    }

    async fn send(&self, payload: WsPayload) -> Result<(), CoordinateError> {
        if !self.is_open() {
            return Err(CoordinateError::ConnNotReady);
        }
        let body = NodeMessageBody::FollowerWsMsg(WsFrame::new(self.websocket_id, &payload));
        let encoded = NodeMessage::unacked(body).encode()?;
        self.runtime
            .driver()
            .publish_to_node(self.follower, encoded)
            .await
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), CoordinateError> {
        if lock(&self.runtime.leader_websockets)
            .remove(&self.websocket_id)
            .is_none()
        {
            return Ok(());
        }
        send_unacked(
            &self.runtime,
            self.follower,
            NodeMessageBody::FollowerWsClose(WsClose {
                websocket_id: self.websocket_id,
                code,
                reason,
            }),
        )
        .await;
        Ok(())
    }
}
