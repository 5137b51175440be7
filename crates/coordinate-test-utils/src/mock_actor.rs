//! Scriptable leader actor.
//!
//! Behavior:
//! - `prepare_conn` rejects params containing `"reject": true`
//! - `create_conn` greets the connection with `{"type": "init", "conn_id": ..}`
//! - `process_message` records the message and echoes `{"type": "echo", "data": ..}`;
//!   `{"type": "kick"}` disconnects the sender with reason `"kicked"`
//! - actions: `increment(n)` adds to a counter and returns it, `fail` errors
//!   with code `"boom"`, anything else errors with `"unknown_action"`
//! - fetch answers 200 with the request body and an `x-actor` header
//! - websockets are greeted with `"hello"` and frames are echoed back
//! - `stop` takes as long as the factory's stop delay (zero by default)

use actor_coordinate::actor::{
    ActionContext, ActorConn, ActorFactory, ActorWebSocket, ConnDriver, ConnRoute, CreateConn,
    FetchRequest, FetchResponse, LeaderActor, WebSocketRequest,
};
use actor_coordinate::driver::ActorMetadata;
use actor_coordinate::errors::ActorError;
use actor_coordinate::protocol::{Headers, WsPayload};
use async_trait::async_trait;
use common::types::{ActorId, ConnId, WebSocketId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockActorState {
    conn_driver: Option<Arc<dyn ConnDriver>>,
    conns: HashMap<ConnId, (ActorConn, ConnRoute)>,
    received: Vec<(ConnId, Value)>,
    removed: Vec<ConnId>,
    actions: Vec<String>,
    counter: i64,
    started: bool,
    stopped: bool,
    sockets: HashMap<WebSocketId, Arc<dyn ActorWebSocket>>,
    socket_frames: Vec<(WebSocketId, WsPayload)>,
    closed_sockets: Vec<WebSocketId>,
}

pub struct MockActor {
    actor_id: ActorId,
    stop_delay: Duration,
    state: Mutex<MockActorState>,
}

impl MockActor {
    pub fn new(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            stop_delay: Duration::ZERO,
            state: Mutex::new(MockActorState::default()),
        }
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn has_conn(&self, conn_id: ConnId) -> bool {
        self.state.lock().unwrap().conns.contains_key(&conn_id)
    }

    pub fn conn_count(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }

    pub fn conn_route(&self, conn_id: ConnId) -> Option<ConnRoute> {
        self.state
            .lock()
            .unwrap()
            .conns
            .get(&conn_id)
            .map(|(_, route)| *route)
    }

    pub fn received_messages(&self) -> Vec<(ConnId, Value)> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn removed_conns(&self) -> Vec<ConnId> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn counter(&self) -> i64 {
        self.state.lock().unwrap().counter
    }

    pub fn socket_frames(&self) -> Vec<(WebSocketId, WsPayload)> {
        self.state.lock().unwrap().socket_frames.clone()
    }

    pub fn closed_sockets(&self) -> Vec<WebSocketId> {
        self.state.lock().unwrap().closed_sockets.clone()
    }

    fn conn_driver(&self) -> Arc<dyn ConnDriver> {
        self.state
            .lock()
            .unwrap()
            .conn_driver
            .clone()
            .expect("actor used before start")
    }
}

#[async_trait]
impl LeaderActor for MockActor {
    async fn start(
        &self,
        conn_driver: Arc<dyn ConnDriver>,
        _actor_id: &ActorId,
        _metadata: &ActorMetadata,
    ) -> Result<(), ActorError> {
        let mut state = self.state.lock().unwrap();
        state.conn_driver = Some(conn_driver);
        state.started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ActorError> {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.state.lock().unwrap().stopped = true;
        Ok(())
    }

    async fn prepare_conn(&self, params: &Value, _auth_data: &Value) -> Result<Value, ActorError> {
        if params.get("reject").and_then(Value::as_bool) == Some(true) {
            return Err(ActorError::new("rejected", "connection rejected"));
        }
        Ok(json!({ "joined": true }))
    }

    async fn create_conn(&self, conn: CreateConn) -> Result<(), ActorError> {
        let route = conn.route;
        self.state.lock().unwrap().conns.insert(
            conn.conn_id,
            (
                ActorConn {
                    id: conn.conn_id,
                    token: conn.conn_token,
                },
                route,
            ),
        );
        self.conn_driver()
            .send_message(
                route,
                json!({ "type": "init", "conn_id": conn.conn_id.to_string() }),
            )
            .await
            .map_err(|e| ActorError::internal(e.to_string()))
    }

    async fn get_conn(&self, conn_id: ConnId) -> Option<ActorConn> {
        self.state
            .lock()
            .unwrap()
            .conns
            .get(&conn_id)
            .map(|(conn, _)| conn.clone())
    }

    async fn remove_conn(&self, conn_id: ConnId) -> bool {
        let mut state = self.state.lock().unwrap();
        state.removed.push(conn_id);
        state.conns.remove(&conn_id).is_some()
    }

    async fn process_message(&self, conn_id: ConnId, message: Value) -> Result<(), ActorError> {
        let route = {
            let mut state = self.state.lock().unwrap();
            state.received.push((conn_id, message.clone()));
            state.conns.get(&conn_id).map(|(_, route)| *route)
        };
        let Some(route) = route else {
            return Err(ActorError::new("unknown_conn", "connection not found"));
        };

        let driver = self.conn_driver();
        let result = if message.get("type").and_then(Value::as_str) == Some("kick") {
            driver.disconnect(route, Some("kicked".to_string())).await
        } else {
            driver
                .send_message(route, json!({ "type": "echo", "data": message }))
                .await
        };
        result.map_err(|e| ActorError::internal(e.to_string()))
    }

    async fn execute_action(
        &self,
        _ctx: ActionContext,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ActorError> {
        let mut state = self.state.lock().unwrap();
        state.actions.push(name.to_string());
        match name {
            "increment" => {
                let by = args.first().and_then(Value::as_i64).unwrap_or(1);
                state.counter += by;
                Ok(json!(state.counter))
            }
            "fail" => Err(ActorError::new("boom", "action failed")),
            other => Err(ActorError::new(
                "unknown_action",
                format!("no action named {other}"),
            )),
        }
    }

    async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse, ActorError> {
        let mut headers = Headers::new();
        headers.insert("x-actor".to_string(), self.actor_id.to_string());
        headers.insert("x-method".to_string(), request.method);
        Ok(FetchResponse {
            status: 200,
            headers,
            body: request.body,
        })
    }

    async fn handle_websocket(
        &self,
        socket: Arc<dyn ActorWebSocket>,
        _request: WebSocketRequest,
    ) -> Result<(), ActorError> {
        self.state
            .lock()
            .unwrap()
            .sockets
            .insert(socket.id(), Arc::clone(&socket));
        socket
            .send(WsPayload::Text("hello".to_string()))
            .await
            .map_err(|e| ActorError::internal(e.to_string()))
    }

    async fn websocket_message(
        &self,
        websocket_id: WebSocketId,
        payload: WsPayload,
    ) -> Result<(), ActorError> {
        let socket = {
            let mut state = self.state.lock().unwrap();
            state.socket_frames.push((websocket_id, payload.clone()));
            state.sockets.get(&websocket_id).cloned()
        };
        let Some(socket) = socket else {
            return Err(ActorError::new("unknown_socket", "websocket not found"));
        };
        socket
            .send(payload)
            .await
            .map_err(|e| ActorError::internal(e.to_string()))
    }

    async fn websocket_close(
        &self,
        websocket_id: WebSocketId,
        _code: Option<u16>,
        _reason: Option<String>,
    ) -> Result<(), ActorError> {
        let mut state = self.state.lock().unwrap();
        state.sockets.remove(&websocket_id);
        state.closed_sockets.push(websocket_id);
        Ok(())
    }
}

/// Factory that hands out [`MockActor`]s and keeps every instance it made.
#[derive(Clone, Default)]
pub struct MockActorFactory {
    instances: Arc<Mutex<Vec<Arc<MockActor>>>>,
    fail: bool,
    stop_delay: Duration,
}

impl MockActorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose every instantiation fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// A factory whose actors take `delay` to stop.
    pub fn with_stop_delay(delay: Duration) -> Self {
        Self {
            stop_delay: delay,
            ..Self::default()
        }
    }

    pub fn instantiated_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Most recent instance for `actor_id`.
    pub fn latest(&self, actor_id: &ActorId) -> Option<Arc<MockActor>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|actor| actor.actor_id() == actor_id)
            .cloned()
    }

    /// Like [`Self::latest`] but panics when there is none.
    pub fn actor(&self, actor_id: &ActorId) -> Arc<MockActor> {
        self.latest(actor_id)
            .unwrap_or_else(|| panic!("no actor {actor_id} was instantiated"))
    }
}

impl ActorFactory for MockActorFactory {
    fn instantiate(
        &self,
        actor_id: &ActorId,
        _metadata: &ActorMetadata,
    ) -> Result<Arc<dyn LeaderActor>, ActorError> {
        if self.fail {
            return Err(ActorError::new("instantiate_failed", "factory refused"));
        }
        let actor = Arc::new(MockActor {
            stop_delay: self.stop_delay,
            ..MockActor::new(actor_id.clone())
        });
        self.instances.lock().unwrap().push(Arc::clone(&actor));
        Ok(actor)
    }
}
