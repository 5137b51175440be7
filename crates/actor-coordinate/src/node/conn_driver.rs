//! Leader-side [`ConnDriver`]: routes actor output to follower nodes.

use crate::actor::{ConnDriver, ConnRoute};
use crate::errors::CoordinateError;
use crate::protocol::{FollowerConnClose, FollowerMsg, NodeMessage, NodeMessageBody};
use crate::runtime::CoordinateRuntime;
use async_trait::async_trait;
use common::types::ActorId;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Publishes `FollowerMsg` / `FollowerConnClose` to the node holding the
/// client. Delivery is best effort; once the owning peer starts stopping,
/// nothing more is sent.
pub(crate) struct LeaderConnDriver {
    runtime: Arc<CoordinateRuntime>,
    actor_id: ActorId,
    stopping: CancellationToken,
}

impl LeaderConnDriver {
    pub(crate) fn new(
        runtime: Arc<CoordinateRuntime>,
        actor_id: ActorId,
        stopping: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            actor_id,
            stopping,
        }
    }

    async fn publish(&self, route: ConnRoute, body: NodeMessageBody) -> Result<(), CoordinateError> {
        if self.stopping.is_cancelled() {
            debug!(
                target: "coordinate.node",
                actor_id = %self.actor_id,
                conn_id = %route.conn_id,
                tag = body.tag(),
                "Actor is stopping, not relaying"
            );
            return Ok(());
        }

        let payload = NodeMessage::unacked(body).encode()?;
        self.runtime
            .driver()
            .publish_to_node(route.node_id, payload)
            .await
    }
}

#[async_trait]
impl ConnDriver for LeaderConnDriver {
    async fn send_message(&self, route: ConnRoute, message: Value) -> Result<(), CoordinateError> {
        self.publish(
            route,
            NodeMessageBody::FollowerMsg(FollowerMsg {
                conn_id: route.conn_id,
                message,
            }),
        )
        .await
    }

    async fn disconnect(
        &self,
        route: ConnRoute,
        reason: Option<String>,
    ) -> Result<(), CoordinateError> {
        self.publish(
            route,
            NodeMessageBody::FollowerConnClose(FollowerConnClose {
                conn_id: route.conn_id,
                reason,
            }),
        )
        .await
    }
}
