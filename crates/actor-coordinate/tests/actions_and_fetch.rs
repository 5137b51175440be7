//! Actions, HTTP fetches and raw WebSockets routed to the actor's leader.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use actor_coordinate::actor::FetchRequest;
use actor_coordinate::errors::CoordinateError;
use actor_coordinate::peer::ActorPeer;
use actor_coordinate::protocol::{Headers, WsPayload};
use actor_coordinate::router::{ActionRequest, ConnectOpts, FetchOpts, RawWebSocketOpts};
use bytes::Bytes;
use common::types::{ActorId, ConnId};
use coordinate_test_utils::{
    eventually, MockActorFactory, MockClientWebSocket, MockTransport, TestCluster,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

fn action(actor_id: &ActorId, name: &str, args: Vec<Value>) -> ActionRequest {
    ActionRequest {
        actor_id: actor_id.clone(),
        action_name: name.to_string(),
        args,
        params: json!({}),
        auth_data: json!({ "user": "alice" }),
    }
}

#[tokio::test(start_paused = true)]
async fn test_action_runs_on_remote_leader() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("counter");
    let _leader = ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    let handlers = cluster.node(1).runtime.handlers();

    let first = handlers
        .on_action(action(&actor_id, "increment", vec![json!(2)]), None)
        .await
        .unwrap();
    let second = handlers
        .on_action(action(&actor_id, "increment", vec![json!(3)]), None)
        .await
        .unwrap();

    assert_eq!(first.output, json!(2));
    assert_eq!(second.output, json!(5));
    let actor = cluster.node(0).actors.actor(&actor_id);
    assert_eq!(actor.actions(), vec!["increment", "increment"]);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_actor_stop_does_not_hold_up_actions() {
    let mut cluster = TestCluster::start(0).await;
    let index = cluster
        .add_node(MockActorFactory::with_stop_delay(Duration::from_secs(5)))
        .await;
    let room = cluster.create_actor("room");
    let counter = cluster.create_actor("counter");
    let node = cluster.node(index);
    let _counter = ActorPeer::acquire(&node.runtime, &counter, ConnId::new())
        .await
        .unwrap();

    let transport = MockTransport::new();
    let session = node.runtime.handlers().on_connect_websocket(ConnectOpts {
        actor_id: room.clone(),
        params: json!({}),
        auth_data: json!(null),
    });
    session.on_open(transport.clone()).await.unwrap();
    transport.next_message().await;

    // The kick drops the room's last reference, and stopping it is slow.
    session.on_message(json!({ "type": "kick" })).await.unwrap();
    eventually("client kicked", || transport.is_disconnected()).await;

    let started = Instant::now();
    let response = node
        .runtime
        .handlers()
        .on_action(action(&counter, "increment", vec![json!(1)]), None)
        .await
        .unwrap();
    assert_eq!(response.output, json!(1));
    assert!(started.elapsed() < Duration::from_secs(1));

    eventually("room stopped", || node.actors.actor(&room).is_stopped()).await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_action_error_keeps_actor_code() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("counter");
    let _leader = ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();

    let result = cluster
        .node(1)
        .runtime
        .handlers()
        .on_action(action(&actor_id, "fail", vec![]), None)
        .await;

    match result {
        Err(CoordinateError::ActorFailed(error)) => {
            assert_eq!(error.code, "boom");
            assert_eq!(error.message, "action failed");
        }
        other => panic!("expected ActorFailed, got {other:?}"),
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_action_without_connections_releases_actor() {
    let cluster = TestCluster::start(1).await;
    let actor_id = cluster.create_actor("counter");
    let node = cluster.node(0);

    let output = node
        .runtime
        .handlers()
        .on_action(action(&actor_id, "increment", vec![]), None)
        .await
        .unwrap();
    assert_eq!(output.output, json!(1));

    let actor = node.actors.actor(&actor_id);
    eventually("temporary reference released", || {
        node.runtime.actor_peer(&actor_id).is_none()
    })
    .await;
    assert!(actor.is_stopped());
    assert_eq!(cluster.driver.lease_holder(&actor_id), None);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_action_on_unknown_actor() {
    let cluster = TestCluster::start(1).await;

    let result = cluster
        .node(0)
        .runtime
        .handlers()
        .on_action(action(&ActorId::from("missing"), "increment", vec![]), None)
        .await;

    assert!(matches!(result, Err(CoordinateError::ActorNotFound(_))));
    assert_eq!(cluster.node(0).runtime.actor_peer_count(), 0);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fetch_served_by_remote_leader() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("api");
    let _leader = ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();

    let mut headers = Headers::new();
    headers.insert("content-type".to_string(), "application/octet-stream".to_string());
    let body = Bytes::from_static(&[0, 159, 146, 150, 255]);

    let response = cluster
        .node(1)
        .runtime
        .handlers()
        .on_fetch(
            FetchOpts {
                actor_id: actor_id.clone(),
                request: FetchRequest {
                    method: "POST".to_string(),
                    url: "http://actor/upload".to_string(),
                    headers,
                    body: Some(body.clone()),
                },
                auth_data: json!(null),
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, Some(body));
    assert_eq!(response.headers.get("x-actor").map(String::as_str), Some("api"));
    assert_eq!(response.headers.get("x-method").map(String::as_str), Some("POST"));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_raw_websocket_relayed_to_leader() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("stream");
    let _leader = ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();
    let follower = cluster.node(1);

    let socket = MockClientWebSocket::new();
    let session = follower
        .runtime
        .handlers()
        .on_raw_websocket(
            RawWebSocketOpts {
                actor_id: actor_id.clone(),
                url: "ws://actor/stream".to_string(),
                headers: Headers::new(),
                auth_data: json!(null),
            },
            socket.clone(),
        )
        .await
        .unwrap();

    assert_eq!(socket.next_frame().await, WsPayload::Text("hello".to_string()));

    let binary = WsPayload::Binary(Bytes::from_static(b"\x00\x01frame"));
    session.on_message(WsPayload::Text("ping".to_string())).await.unwrap();
    session.on_message(binary.clone()).await.unwrap();
    assert_eq!(socket.next_frame().await, WsPayload::Text("ping".to_string()));
    assert_eq!(socket.next_frame().await, binary);

    let actor = cluster.node(0).actors.actor(&actor_id);
    assert_eq!(actor.socket_frames().len(), 2);

    session.on_close(Some(1000), None).await;
    eventually("leader saw the close", || {
        actor.closed_sockets().contains(&session.websocket_id())
    })
    .await;
    eventually("follower released its peer", || {
        follower.runtime.actor_peer(&actor_id).is_none()
    })
    .await;
    assert!(socket.close_frame().is_none());

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_raw_websocket_closed_when_leader_stops_actor() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("stream");
    let leader = ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();

    let socket = MockClientWebSocket::new();
    let session = cluster
        .node(1)
        .runtime
        .handlers()
        .on_raw_websocket(
            RawWebSocketOpts {
                actor_id: actor_id.clone(),
                url: "ws://actor/stream".to_string(),
                headers: Headers::new(),
                auth_data: json!(null),
            },
            socket.clone(),
        )
        .await
        .unwrap();
    socket.next_frame().await;

    leader.dispose(true).await;

    eventually("client socket closed", || socket.close_frame().is_some()).await;
    let (code, _) = socket.close_frame().unwrap();
    assert_eq!(code, Some(1012));
    assert!(cluster.node(0).actors.actor(&actor_id).is_stopped());

    session.on_close(None, None).await;
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_raw_websocket_closed_when_leader_unreachable() {
    let cluster = TestCluster::start(2).await;
    let actor_id = cluster.create_actor("stream");
    let leader_node = cluster.node(0).runtime.node_id();
    let _leader = ActorPeer::acquire(&cluster.node(0).runtime, &actor_id, ConnId::new())
        .await
        .unwrap();

    let socket = MockClientWebSocket::new();
    let session = cluster
        .node(1)
        .runtime
        .handlers()
        .on_raw_websocket(
            RawWebSocketOpts {
                actor_id: actor_id.clone(),
                url: "ws://actor/stream".to_string(),
                headers: Headers::new(),
                auth_data: json!(null),
            },
            socket.clone(),
        )
        .await
        .unwrap();
    socket.next_frame().await;

    cluster.driver.partition(leader_node);
    let result = session.on_message(WsPayload::Text("lost".to_string())).await;

    assert!(matches!(result, Err(CoordinateError::LeaderChanged(_))));
    let (code, _) = socket.close_frame().unwrap();
    assert_eq!(code, Some(1012));

    session.on_close(None, None).await;
    cluster.driver.heal(leader_node);
    cluster.shutdown().await;
}
