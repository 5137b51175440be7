//! Handlers for messages a leader sends back to the node holding the client.

use super::record_missing;
use crate::observability::metrics;
use crate::protocol::{
    FollowerActionResp, FollowerConnClose, FollowerFetchResp, FollowerMsg, FollowerWsOpen,
    WsClose, WsFrame,
};
use crate::runtime::{lock, CoordinateRuntime};
use std::sync::Arc;
use tracing::{debug, warn};

pub(super) async fn handle_conn_close(runtime: Arc<CoordinateRuntime>, close: FollowerConnClose) {
    let Some(conn) = runtime.relay_conn(close.conn_id) else {
        record_missing("fcc", "conn_id", &close.conn_id);
        return;
    };
    conn.disconnect(true, close.reason).await;
}

pub(super) async fn handle_msg(runtime: &Arc<CoordinateRuntime>, msg: FollowerMsg) {
    let Some(conn) = runtime.relay_conn(msg.conn_id) else {
        record_missing("fm", "conn_id", &msg.conn_id);
        return;
    };
    conn.on_message(msg.message).await;
}

pub(super) fn handle_action_response(runtime: &CoordinateRuntime, response: FollowerActionResp) {
    let resolver = lock(&runtime.action_resolvers).remove(&response.request_id);
    let Some(resolver) = resolver else {
        record_missing("far", "request_id", &response.request_id);
        return;
    };
    if resolver.send(response).is_err() {
        debug!(
            target: "coordinate.node",
            "Action requester went away before the response arrived"
        );
    }
}

pub(super) fn handle_fetch_response(runtime: &CoordinateRuntime, response: FollowerFetchResp) {
    let resolver = lock(&runtime.fetch_resolvers).remove(&response.request_id);
    let Some(resolver) = resolver else {
        record_missing("ffr", "request_id", &response.request_id);
        return;
    };
    if resolver.send(response).is_err() {
        debug!(
            target: "coordinate.node",
            "Fetch requester went away before the response arrived"
        );
    }
}

pub(super) fn handle_ws_open(runtime: &CoordinateRuntime, open: FollowerWsOpen) {
    if lock(&runtime.relay_websockets).contains_key(&open.websocket_id) {
        debug!(
            target: "coordinate.node",
            websocket_id = %open.websocket_id,
            "Leader accepted websocket"
        );
    } else {
        record_missing("fwo", "websocket_id", &open.websocket_id);
    }
}

pub(super) async fn handle_ws_message(runtime: &CoordinateRuntime, frame: WsFrame) {
    let relayed = lock(&runtime.relay_websockets)
        .get(&frame.websocket_id)
        .cloned();
    let Some(relayed) = relayed else {
        record_missing("fwm", "websocket_id", &frame.websocket_id);
        return;
    };

    let payload = match frame.payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                target: "coordinate.node",
                websocket_id = %frame.websocket_id,
                error = %e,
                "Undecodable websocket frame"
            );
            metrics::record_message_dropped("decode");
            return;
        }
    };

    if let Err(e) = relayed.socket.send(payload).await {
        debug!(
            target: "coordinate.node",
            websocket_id = %frame.websocket_id,
            error = %e,
            "Failed to deliver frame to client"
        );
    }
}

pub(super) async fn handle_ws_close(runtime: &CoordinateRuntime, close: WsClose) {
    let relayed = lock(&runtime.relay_websockets).remove(&close.websocket_id);
    let Some(relayed) = relayed else {
        record_missing("fwc", "websocket_id", &close.websocket_id);
        return;
    };

    if let Err(e) = relayed.socket.close(close.code, close.reason).await {
        debug!(
            target: "coordinate.node",
            websocket_id = %close.websocket_id,
            error = %e,
            "Failed to close client websocket"
        );
    }
}
