//! Interface to the actor implementation hosted on the leader.
//!
//! The coordination layer never touches actor state directly. It creates
//! actors through an [`ActorFactory`] when this node becomes leader and
//! drives them through [`LeaderActor`].

use crate::driver::ActorMetadata;
use crate::errors::{ActorError, CoordinateError};
use crate::protocol::{Headers, WsPayload};
use async_trait::async_trait;
use bytes::Bytes;
use common::secret::SecretString;
use common::types::{ActorId, ConnId, NodeId, WebSocketId};
use serde_json::Value;
use std::sync::Arc;

/// Where a relayed connection lives: the follower node holding the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRoute {
    pub conn_id: ConnId,
    pub node_id: NodeId,
}

/// Everything the actor needs to register a new connection.
#[derive(Debug, Clone)]
pub struct CreateConn {
    pub conn_id: ConnId,
    pub conn_token: SecretString,
    pub params: Value,
    /// Output of [`LeaderActor::prepare_conn`].
    pub state: Value,
    pub route: ConnRoute,
    pub auth_data: Value,
}

/// A connection as stored by the actor.
#[derive(Debug, Clone)]
pub struct ActorConn {
    pub id: ConnId,
    pub token: SecretString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub actor_id: ActorId,
    pub params: Value,
    pub auth_data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketRequest {
    pub url: String,
    pub headers: Headers,
    pub auth_data: Value,
}

/// Outbound path from the actor to its relayed connections.
///
/// Handed to [`LeaderActor::start`]. Messages are published to the follower
/// node named in the connection's [`ConnRoute`].
#[async_trait]
pub trait ConnDriver: Send + Sync {
    async fn send_message(&self, route: ConnRoute, message: Value) -> Result<(), CoordinateError>;

    async fn disconnect(
        &self,
        route: ConnRoute,
        reason: Option<String>,
    ) -> Result<(), CoordinateError>;
}

/// Leader-side end of a relayed raw WebSocket.
#[async_trait]
pub trait ActorWebSocket: Send + Sync {
    fn id(&self) -> WebSocketId;

    async fn send(&self, payload: WsPayload) -> Result<(), CoordinateError>;

    async fn close(&self, code: Option<u16>, reason: Option<String>)
        -> Result<(), CoordinateError>;
}

/// Live actor instance owned by the leader node.
#[async_trait]
pub trait LeaderActor: Send + Sync {
    async fn start(
        &self,
        conn_driver: Arc<dyn ConnDriver>,
        actor_id: &ActorId,
        metadata: &ActorMetadata,
    ) -> Result<(), ActorError>;

    /// Persist and shut down. Called once when leadership ends.
    async fn stop(&self) -> Result<(), ActorError>;

    /// Validate connection parameters and produce the initial connection state.
    async fn prepare_conn(&self, params: &Value, auth_data: &Value) -> Result<Value, ActorError>;

    async fn create_conn(&self, conn: CreateConn) -> Result<(), ActorError>;

    async fn get_conn(&self, conn_id: ConnId) -> Option<ActorConn>;

    /// Returns `false` if the connection was unknown.
    async fn remove_conn(&self, conn_id: ConnId) -> bool;

    async fn process_message(&self, conn_id: ConnId, message: Value) -> Result<(), ActorError>;

    async fn execute_action(
        &self,
        ctx: ActionContext,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ActorError>;

    async fn handle_fetch(&self, _request: FetchRequest) -> Result<FetchResponse, ActorError> {
        Err(ActorError::unsupported("fetch"))
    }

    async fn handle_websocket(
        &self,
        _socket: Arc<dyn ActorWebSocket>,
        _request: WebSocketRequest,
    ) -> Result<(), ActorError> {
        Err(ActorError::unsupported("websocket"))
    }

    async fn websocket_message(
        &self,
        _websocket_id: WebSocketId,
        _payload: WsPayload,
    ) -> Result<(), ActorError> {
        Ok(())
    }

    async fn websocket_close(
        &self,
        _websocket_id: WebSocketId,
        _code: Option<u16>,
        _reason: Option<String>,
    ) -> Result<(), ActorError> {
        Ok(())
    }
}

/// Creates actor instances on promotion to leader.
pub trait ActorFactory: Send + Sync {
    fn instantiate(
        &self,
        actor_id: &ActorId,
        metadata: &ActorMetadata,
    ) -> Result<Arc<dyn LeaderActor>, ActorError>;
}
