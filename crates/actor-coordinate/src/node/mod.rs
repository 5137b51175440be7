//! Node message dispatch.
//!
//! Each runtime runs one dispatcher task that owns the node's subscription.
//! For every inbound message it:
//!
//! 1. Decodes the envelope, dropping anything malformed.
//! 2. Acknowledges it when the envelope carries a sender and message id.
//! 3. Routes the body to the leader-side or follower-side handler.
//!
//! Handlers run inline so that messages from one sender are processed in
//! publish order. Actions, fetches and follower-side connection closes are
//! the exception: they can run actor code of unbounded duration (a close may
//! dispose the peer and stop its actor), so each gets its own task.
//!
//! A bad message never stops the loop. It exits when the runtime shuts down.
//! If the subscription closes, the node can no longer be reached and the
//! runtime is halted so its leases move elsewhere.

mod action;
mod conn_driver;
mod fetch;
mod follower;
mod leader;
mod publisher;
mod websocket;

pub use action::{publish_action_to_leader, ActionRequest};
pub(crate) use conn_driver::LeaderConnDriver;
pub use fetch::publish_fetch_to_leader;
pub use publisher::{publish_message_to_leader, publish_message_to_leader_no_retry};

use crate::driver::NodeSubscriber;
use crate::observability::metrics;
use crate::protocol::{Ack, NodeMessage, NodeMessageBody};
use crate::runtime::{lock, CoordinateRuntime};
use common::types::{ActorId, MessageId, NodeId};
use std::fmt::Display;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

pub(crate) async fn run_dispatcher(
    runtime: Weak<CoordinateRuntime>,
    mut subscriber: NodeSubscriber,
    shutdown: CancellationToken,
) {
    info!(target: "coordinate.node", "Node dispatcher started");

    loop {
        let raw = tokio::select! {
            () = shutdown.cancelled() => break,
            raw = subscriber.recv() => raw,
        };

        let Some(raw) = raw else {
            error!(target: "coordinate.node", "Node subscription closed");
            if let Some(runtime) = runtime.upgrade() {
                runtime.halt("node subscription lost").await;
            }
            break;
        };
        let Some(runtime) = runtime.upgrade() else {
            break;
        };

        handle_raw_message(&runtime, &raw).await;
    }

    info!(target: "coordinate.node", "Node dispatcher stopped");
}

#[instrument(skip_all)]
pub(crate) async fn handle_raw_message(runtime: &Arc<CoordinateRuntime>, raw: &[u8]) {
    let message = match NodeMessage::decode(raw) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                target: "coordinate.node",
                error = %e,
                len = raw.len(),
                "Dropping undecodable node message"
            );
            metrics::record_message_dropped("decode");
            return;
        }
    };

    let tag = message.body.tag();
    metrics::record_message_received(tag);
    trace!(
        target: "coordinate.node",
        tag = tag,
        sender = ?message.sender_node_id,
        "Received node message"
    );

    if let (Some(sender), Some(message_id)) = (message.sender_node_id, message.message_id) {
        if matches!(message.body, NodeMessageBody::Ack(_)) {
            warn!(
                target: "coordinate.node",
                message_id = %message_id,
                "Ack requested an acknowledgement, dropping"
            );
            metrics::record_message_dropped("protocol");
            return;
        }
        send_ack(runtime, sender, message_id).await;
    }

    dispatch(runtime, message.sender_node_id, message.body).await;
}

async fn dispatch(runtime: &Arc<CoordinateRuntime>, sender: Option<NodeId>, body: NodeMessageBody) {
    match body {
        NodeMessageBody::Ack(ack) => resolve_ack(runtime, &ack),
        NodeMessageBody::LeaderConnOpen(open) => leader::handle_conn_open(runtime, sender, open).await,
        NodeMessageBody::LeaderConnClose(close) => leader::handle_conn_close(runtime, close).await,
        NodeMessageBody::LeaderMsg(msg) => leader::handle_msg(runtime, msg).await,
        NodeMessageBody::LeaderAction(action) => {
            tokio::spawn(leader::handle_action(Arc::clone(runtime), sender, action));
        }
        NodeMessageBody::LeaderFetch(fetch) => {
            tokio::spawn(leader::handle_fetch(Arc::clone(runtime), sender, fetch));
        }
        NodeMessageBody::LeaderWsOpen(open) => leader::handle_ws_open(runtime, sender, open).await,
        NodeMessageBody::LeaderWsMsg(frame) => leader::handle_ws_message(runtime, frame).await,
        NodeMessageBody::LeaderWsClose(close) => leader::handle_ws_close(runtime, close).await,
        NodeMessageBody::FollowerConnClose(close) => {
            tokio::spawn(follower::handle_conn_close(Arc::clone(runtime), close));
        }
        NodeMessageBody::FollowerMsg(msg) => follower::handle_msg(runtime, msg).await,
        NodeMessageBody::FollowerActionResp(response) => {
            follower::handle_action_response(runtime, response);
        }
        NodeMessageBody::FollowerFetchResp(response) => {
            follower::handle_fetch_response(runtime, response);
        }
        NodeMessageBody::FollowerWsOpen(open) => follower::handle_ws_open(runtime, open),
        NodeMessageBody::FollowerWsMsg(frame) => follower::handle_ws_message(runtime, frame).await,
        NodeMessageBody::FollowerWsClose(close) => follower::handle_ws_close(runtime, close).await,
    }
}

fn resolve_ack(runtime: &CoordinateRuntime, ack: &Ack) {
    let resolver = lock(&runtime.ack_resolvers).remove(&ack.message_id);
    match resolver {
        Some(resolver) => {
            // The publisher may have timed out in between; nothing to do then.
            let _ = resolver.send(());
        }
        None => {
            warn!(
                target: "coordinate.node",
                message_id = %ack.message_id,
                "Ack for unknown message"
            );
        }
    }
}

async fn send_ack(runtime: &CoordinateRuntime, sender: NodeId, message_id: MessageId) {
    send_unacked(runtime, sender, NodeMessageBody::Ack(Ack { message_id })).await;
}

/// Fire-and-forget publish; failures are logged.
pub(crate) async fn send_unacked(runtime: &CoordinateRuntime, target: NodeId, body: NodeMessageBody) {
    let tag = body.tag();
    let payload = match NodeMessage::unacked(body).encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                target: "coordinate.node",
                tag = tag,
                error = %e,
                "Failed to encode node message"
            );
            return;
        }
    };

    if let Err(e) = runtime.driver().publish_to_node(target, payload).await {
        warn!(
            target: "coordinate.node",
            node_id = %target,
            tag = tag,
            error = %e,
            "Failed to publish node message"
        );
    }
}

fn record_no_target(tag: &'static str, actor_id: &ActorId) {
    warn!(
        target: "coordinate.node",
        actor_id = %actor_id,
        tag = tag,
        "Actor is not led by this node, dropping"
    );
    metrics::record_message_dropped("no_target");
}

fn record_missing(tag: &'static str, kind: &'static str, id: &dyn Display) {
    debug!(
        target: "coordinate.node",
        tag = tag,
        kind = kind,
        id = %id,
        "Target no longer exists, dropping"
    );
    metrics::record_message_dropped("no_target");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actor::{ActorFactory, LeaderActor};
    use crate::config::ActorPeerConfig;
    use crate::driver::{ActorMetadata, CoordinateDriver, MemoryCoordinateDriver};
    use crate::errors::ActorError;
    use crate::protocol::{FollowerConnClose, LeaderConnClose};
    use common::types::ConnId;
    use std::time::Duration;
    use tokio::sync::oneshot;

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

    async fn runtime_with_peer_node(
        driver: &MemoryCoordinateDriver,
    ) -> (Arc<CoordinateRuntime>, NodeId, NodeSubscriber) {
        let runtime = CoordinateRuntime::start(
            Arc::new(driver.clone()),
            Arc::new(NoActors),
            ActorPeerConfig::default(),
        )
        .await
        .unwrap();
        let peer_node = NodeId::new();
        let peer_rx = driver.create_node_subscriber(peer_node).await.unwrap();
        (runtime, peer_node, peer_rx)
    }

    fn close_body() -> NodeMessageBody {
        NodeMessageBody::FollowerConnClose(FollowerConnClose {
            conn_id: ConnId::new(),
            reason: None,
        })
    }

    #[tokio::test]
    async fn test_acks_messages_that_request_it() {
        let driver = MemoryCoordinateDriver::new();
        let (runtime, peer_node, mut peer_rx) = runtime_with_peer_node(&driver).await;

        let message_id = MessageId::new();
        let raw = NodeMessage::acked(peer_node, message_id, close_body())
            .encode()
            .unwrap();
        handle_raw_message(&runtime, &raw).await;

        let reply = NodeMessage::decode(&peer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.body, NodeMessageBody::Ack(Ack { message_id }));
        assert!(reply.sender_node_id.is_none());
        assert!(reply.message_id.is_none());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_does_not_ack_unacked_messages() {
        let driver = MemoryCoordinateDriver::new();
        let (runtime, peer_node, mut peer_rx) = runtime_with_peer_node(&driver).await;

        let raw = NodeMessage::unacked(close_body()).encode().unwrap();
        handle_raw_message(&runtime, &raw).await;

        assert!(peer_rx.try_recv().is_err());
        assert_eq!(driver.published_count(peer_node), 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_requesting_ack_is_dropped() {
        let driver = MemoryCoordinateDriver::new();
        let (runtime, peer_node, mut peer_rx) = runtime_with_peer_node(&driver).await;

        let pending = MessageId::new();
        let (tx, mut rx) = oneshot::channel();
        lock(&runtime.ack_resolvers).insert(pending, tx);

        let raw = NodeMessage::acked(
            peer_node,
            MessageId::new(),
            NodeMessageBody::Ack(Ack {
                message_id: pending,
            }),
        )
        .encode()
        .unwrap();
        handle_raw_message(&runtime, &raw).await;

        assert!(peer_rx.try_recv().is_err());
        assert!(rx.try_recv().is_err());
        assert!(lock(&runtime.ack_resolvers).contains_key(&pending));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_publish() {
        let driver = MemoryCoordinateDriver::new();
        let (runtime, _peer_node, _peer_rx) = runtime_with_peer_node(&driver).await;

        let message_id = MessageId::new();
        let (tx, rx) = oneshot::channel();
        lock(&runtime.ack_resolvers).insert(message_id, tx);

        let raw = NodeMessage::unacked(NodeMessageBody::Ack(Ack { message_id }))
            .encode()
            .unwrap();
        handle_raw_message(&runtime, &raw).await;

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(lock(&runtime.ack_resolvers).is_empty());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_garbage_does_not_stop_dispatcher() {
        let driver = MemoryCoordinateDriver::new();
        let (runtime, peer_node, mut peer_rx) = runtime_with_peer_node(&driver).await;

        driver
            .publish_to_node(runtime.node_id(), bytes::Bytes::from_static(b"not json"))
            .await
            .unwrap();

        // A later valid message is still acknowledged through the live loop.
        let message_id = MessageId::new();
        let body = NodeMessageBody::LeaderConnClose(LeaderConnClose {
            actor_id: ActorId::from("nobody"),
            conn_id: ConnId::new(),
        });
        let raw = NodeMessage::acked(peer_node, message_id, body).encode().unwrap();
        driver.publish_to_node(runtime.node_id(), raw).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), peer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let reply = NodeMessage::decode(&reply).unwrap();
        assert_eq!(reply.body, NodeMessageBody::Ack(Ack { message_id }));

        runtime.shutdown().await;
    }
}
