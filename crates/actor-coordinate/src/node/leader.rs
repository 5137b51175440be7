//! Handlers for messages addressed to an actor's leader.

use super::websocket::RelayedActorWebSocket;
use super::{record_no_target, send_unacked};
use crate::actor::{
    ActionContext, ConnRoute, CreateConn, FetchRequest, FetchResponse, WebSocketRequest,
};
use crate::errors::ActorError;
use crate::observability::metrics;
use crate::peer::ActorPeer;
use crate::protocol::{
    decode_body, encode_body, FollowerActionResp, FollowerConnClose, FollowerFetchResp,
    FollowerWsOpen, Headers, LeaderAction, LeaderConnClose, LeaderConnOpen, LeaderFetch,
    LeaderMsg, LeaderWsOpen, NodeMessageBody, WsClose, WsFrame,
};
use crate::runtime::{lock, CoordinateRuntime, LeaderWebSocket};
use crate::token::verify_conn_token;
use common::secret::SecretString;
use common::types::{ActorId, NodeId};
use std::sync::Arc;
use tracing::{debug, warn};

const CLOSE_INTERNAL_ERROR: u16 = 1011;

fn actor_not_here(actor_id: &ActorId) -> ActorError {
    ActorError::new(
        "actor_not_found",
        format!("actor {actor_id} is not running on this node"),
    )
}

pub(super) async fn handle_conn_open(
    runtime: &Arc<CoordinateRuntime>,
    sender: Option<NodeId>,
    open: LeaderConnOpen,
) {
    let Some(follower) = sender else {
        warn!(
            target: "coordinate.node",
            conn_id = %open.conn_id,
            "Connection open without a sender node, dropping"
        );
        metrics::record_message_dropped("protocol");
        return;
    };

    let Some(actor) = ActorPeer::get_leader_actor(runtime, &open.actor_id).await else {
        record_no_target("lco", &open.actor_id);
        return;
    };

    let route = ConnRoute {
        conn_id: open.conn_id,
        node_id: follower,
    };

    let state = match actor.prepare_conn(&open.params, &open.auth_data).await {
        Ok(state) => state,
        Err(e) => {
            debug!(
                target: "coordinate.node",
                actor_id = %open.actor_id,
                conn_id = %open.conn_id,
                error = %e,
                "Actor rejected connection"
            );
            reject_conn(runtime, route, e.message).await;
            return;
        }
    };

    let create = CreateConn {
        conn_id: open.conn_id,
        conn_token: SecretString::from(open.conn_token),
        params: open.params,
        state,
        route,
        auth_data: open.auth_data,
    };
    if let Err(e) = actor.create_conn(create).await {
        warn!(
            target: "coordinate.node",
            actor_id = %open.actor_id,
            conn_id = %route.conn_id,
            error = %e,
            "Actor failed to create connection"
        );
        reject_conn(runtime, route, e.message).await;
    }
}

async fn reject_conn(runtime: &CoordinateRuntime, route: ConnRoute, reason: String) {
    send_unacked(
        runtime,
        route.node_id,
        NodeMessageBody::FollowerConnClose(FollowerConnClose {
            conn_id: route.conn_id,
            reason: Some(reason),
        }),
    )
    .await;
}

pub(super) async fn handle_conn_close(runtime: &Arc<CoordinateRuntime>, close: LeaderConnClose) {
    let Some(actor) = ActorPeer::get_leader_actor(runtime, &close.actor_id).await else {
        record_no_target("lcc", &close.actor_id);
        return;
    };
    if !actor.remove_conn(close.conn_id).await {
        debug!(
            target: "coordinate.node",
            actor_id = %close.actor_id,
            conn_id = %close.conn_id,
            "Closed connection was not registered"
        );
    }
}

pub(super) async fn handle_msg(runtime: &Arc<CoordinateRuntime>, msg: LeaderMsg) {
    let Some(actor) = ActorPeer::get_leader_actor(runtime, &msg.actor_id).await else {
        record_no_target("lm", &msg.actor_id);
        return;
    };

    let Some(conn) = actor.get_conn(msg.conn_id).await else {
        warn!(
            target: "coordinate.node",
            actor_id = %msg.actor_id,
            conn_id = %msg.conn_id,
            "Message for unknown connection"
        );
        metrics::record_message_dropped("no_target");
        return;
    };

    if !verify_conn_token(&conn.token, &msg.conn_token) {
        warn!(
            target: "coordinate.node",
            actor_id = %msg.actor_id,
            conn_id = %msg.conn_id,
            "Connection token mismatch, rejecting message"
        );
        metrics::record_conn_token_rejected();
        return;
    }

    if let Err(e) = actor.process_message(msg.conn_id, msg.message).await {
        warn!(
            target: "coordinate.node",
            actor_id = %msg.actor_id,
            conn_id = %msg.conn_id,
            error = %e,
            "Actor failed to process message"
        );
    }
}

pub(super) async fn handle_action(
    runtime: Arc<CoordinateRuntime>,
    sender: Option<NodeId>,
    action: LeaderAction,
) {
    let Some(follower) = sender else {
        warn!(
            target: "coordinate.node",
            request_id = %action.request_id,
            "Action without a sender node, dropping"
        );
        metrics::record_message_dropped("protocol");
        return;
    };

    let result = match ActorPeer::get_leader_actor(&runtime, &action.actor_id).await {
        Some(actor) => {
            let ctx = ActionContext {
                actor_id: action.actor_id.clone(),
                params: action.params,
                auth_data: action.auth_data,
            };
            actor
                .execute_action(ctx, &action.action_name, action.action_args)
                .await
        }
        None => Err(actor_not_here(&action.actor_id)),
    };

    if let Err(e) = &result {
        debug!(
            target: "coordinate.node",
            actor_id = %action.actor_id,
            action = %action.action_name,
            error = %e,
            "Action failed"
        );
    }

    send_unacked(
        &runtime,
        follower,
        NodeMessageBody::FollowerActionResp(FollowerActionResp::from_result(
            action.request_id,
            result,
        )),
    )
    .await;
}

pub(super) async fn handle_fetch(
    runtime: Arc<CoordinateRuntime>,
    sender: Option<NodeId>,
    fetch: LeaderFetch,
) {
    let Some(follower) = sender else {
        warn!(
            target: "coordinate.node",
            request_id = %fetch.request_id,
            "Fetch without a sender node, dropping"
        );
        metrics::record_message_dropped("protocol");
        return;
    };

    let result = run_fetch(&runtime, &fetch).await;
    let response = match result {
        Ok(response) => FollowerFetchResp {
            request_id: fetch.request_id,
            status: response.status,
            headers: response.headers,
            body: encode_body(response.body.as_ref()),
            error: None,
        },
        Err(e) => FollowerFetchResp {
            request_id: fetch.request_id,
            status: 500,
            headers: Headers::new(),
            body: None,
            error: Some(e),
        },
    };

    send_unacked(&runtime, follower, NodeMessageBody::FollowerFetchResp(response)).await;
}

async fn run_fetch(
    runtime: &CoordinateRuntime,
    fetch: &LeaderFetch,
) -> Result<FetchResponse, ActorError> {
    let Some(actor) = ActorPeer::get_leader_actor(runtime, &fetch.actor_id).await else {
        return Err(actor_not_here(&fetch.actor_id));
    };
    let body = decode_body(fetch.body.as_deref())
        .map_err(|e| ActorError::new("bad_request", e.to_string()))?;
    actor
        .handle_fetch(FetchRequest {
            method: fetch.method.clone(),
            url: fetch.url.clone(),
            headers: fetch.headers.clone(),
            body,
        })
        .await
}

pub(super) async fn handle_ws_open(
    runtime: &Arc<CoordinateRuntime>,
    sender: Option<NodeId>,
    open: LeaderWsOpen,
) {
    let Some(follower) = sender else {
        warn!(
            target: "coordinate.node",
            websocket_id = %open.websocket_id,
            "WebSocket open without a sender node, dropping"
        );
        metrics::record_message_dropped("protocol");
        return;
    };

    let Some(actor) = ActorPeer::get_leader_actor(runtime, &open.actor_id).await else {
        record_no_target("lwo", &open.actor_id);
        refuse_websocket(runtime, follower, &open, "actor not found".to_string()).await;
        return;
    };

    lock(&runtime.leader_websockets).insert(
        open.websocket_id,
        LeaderWebSocket {
            actor_id: open.actor_id.clone(),
            follower,
        },
    );
    send_unacked(
        runtime,
        follower,
        NodeMessageBody::FollowerWsOpen(FollowerWsOpen {
            websocket_id: open.websocket_id,
        }),
    )
    .await;

    let socket = Arc::new(RelayedActorWebSocket::new(
        Arc::clone(runtime),
        open.websocket_id,
        follower,
    ));
    let request = WebSocketRequest {
        url: open.url.clone(),
        headers: open.headers.clone(),
        auth_data: open.auth_data.clone(),
    };
    if let Err(e) = actor.handle_websocket(socket, request).await {
        warn!(
            target: "coordinate.node",
            actor_id = %open.actor_id,
            websocket_id = %open.websocket_id,
            error = %e,
            "Actor refused websocket"
        );
        lock(&runtime.leader_websockets).remove(&open.websocket_id);
        refuse_websocket(runtime, follower, &open, e.message).await;
    }
}

async fn refuse_websocket(
    runtime: &CoordinateRuntime,
    follower: NodeId,
    open: &LeaderWsOpen,
    reason: String,
) {
    send_unacked(
        runtime,
        follower,
        NodeMessageBody::FollowerWsClose(WsClose {
            websocket_id: open.websocket_id,
            code: Some(CLOSE_INTERNAL_ERROR),
            reason: Some(reason),
        }),
    )
    .await;
}

pub(super) async fn handle_ws_message(runtime: &Arc<CoordinateRuntime>, frame: WsFrame) {
    let entry = lock(&runtime.leader_websockets)
        .get(&frame.websocket_id)
        .cloned();
    let Some(entry) = entry else {
        debug!(
            target: "coordinate.node",
            websocket_id = %frame.websocket_id,
            "Frame for unknown websocket"
        );
        metrics::record_message_dropped("no_target");
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

    let Some(actor) = ActorPeer::get_leader_actor(runtime, &entry.actor_id).await else {
        record_no_target("lwm", &entry.actor_id);
        return;
    };
    if let Err(e) = actor.websocket_message(frame.websocket_id, payload).await {
        warn!(
            target: "coordinate.node",
            actor_id = %entry.actor_id,
            websocket_id = %frame.websocket_id,
            error = %e,
            "Actor failed to handle websocket frame"
        );
    }
}

pub(super) async fn handle_ws_close(runtime: &Arc<CoordinateRuntime>, close: WsClose) {
    let entry = lock(&runtime.leader_websockets).remove(&close.websocket_id);
    let Some(entry) = entry else {
        debug!(
            target: "coordinate.node",
            websocket_id = %close.websocket_id,
            "Close for unknown websocket"
        );
        return;
    };

    let Some(actor) = ActorPeer::get_leader_actor(runtime, &entry.actor_id).await else {
        record_no_target("lwc", &entry.actor_id);
        return;
    };
    if let Err(e) = actor
        .websocket_close(close.websocket_id, close.code, close.reason)
        .await
    {
        warn!(
            target: "coordinate.node",
            actor_id = %entry.actor_id,
            websocket_id = %close.websocket_id,
            error = %e,
            "Actor failed to handle websocket close"
        );
    }
}
