//! Transport-facing entry points.
//!
//! A server embedding the runtime calls these when a client connects,
//! sends, or disconnects. The adapters never care whether the actor is led
//! locally or remotely; every path goes through the relay and publisher.

mod raw_websocket;
mod sse;
mod websocket;

pub use crate::node::ActionRequest;
pub use raw_websocket::RawWebSocketSession;
pub use sse::SseSession;
pub use websocket::WebSocketSession;

use crate::actor::{FetchRequest, FetchResponse};
use crate::errors::CoordinateError;
use crate::node::{publish_action_to_leader, publish_fetch_to_leader, publish_message_to_leader};
use crate::protocol::{Headers, LeaderMsg, NodeMessageBody};
use crate::relay::ClientWebSocket;
use crate::runtime::CoordinateRuntime;
use common::types::{ActorId, ConnId};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Parameters of a new WebSocket or SSE connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOpts {
    pub actor_id: ActorId,
    pub params: Value,
    pub auth_data: Value,
}

/// A client message arriving outside the connection's own stream, e.g. an
/// HTTP POST from an SSE client.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnMessageOpts {
    pub actor_id: ActorId,
    pub conn_id: ConnId,
    pub conn_token: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOpts {
    pub actor_id: ActorId,
    pub request: FetchRequest,
    pub auth_data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawWebSocketOpts {
    pub actor_id: ActorId,
    pub url: String,
    pub headers: Headers,
    pub auth_data: Value,
}

/// Handlers bound to one runtime. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandlers {
    runtime: Arc<CoordinateRuntime>,
}

impl ConnectionHandlers {
    pub(crate) fn new(runtime: Arc<CoordinateRuntime>) -> Self {
        Self { runtime }
    }

    pub fn on_connect_websocket(&self, opts: ConnectOpts) -> WebSocketSession {
        WebSocketSession::new(Arc::clone(&self.runtime), opts)
    }

    pub fn on_connect_sse(&self, opts: ConnectOpts) -> SseSession {
        SseSession::new(Arc::clone(&self.runtime), opts)
    }

    /// Run an action on the actor.
    ///
    /// # Errors
    ///
    /// `CoordinateError::ActorFailed` carries the actor's own error; other
    /// variants are coordination failures.
    pub async fn on_action(
        &self,
        request: ActionRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<ActionOutput, CoordinateError> {
        let output = publish_action_to_leader(&self.runtime, request, cancel).await?;
        Ok(ActionOutput { output })
    }

    /// Deliver a message for a connection identified by id and token.
    ///
    /// The leader checks the token; a mismatch is dropped there, so an
    /// acknowledged message is not proof of acceptance.
    ///
    /// # Errors
    ///
    /// Delivery errors from the publisher.
    #[instrument(skip_all, fields(actor_id = %opts.actor_id, conn_id = %opts.conn_id))]
    pub async fn on_conn_message(
        &self,
        opts: ConnMessageOpts,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), CoordinateError> {
        let body = NodeMessageBody::LeaderMsg(LeaderMsg {
            actor_id: opts.actor_id.clone(),
            conn_id: opts.conn_id,
            conn_token: opts.conn_token,
            message: opts.message,
        });
        publish_message_to_leader(&self.runtime, &opts.actor_id, body, cancel).await?;
        Ok(())
    }

    /// Serve an HTTP request with the actor's fetch handler.
    ///
    /// # Errors
    ///
    /// `CoordinateError::ActorFailed` if the actor cannot serve it.
    pub async fn on_fetch(
        &self,
        opts: FetchOpts,
        cancel: Option<&CancellationToken>,
    ) -> Result<FetchResponse, CoordinateError> {
        publish_fetch_to_leader(
            &self.runtime,
            &opts.actor_id,
            opts.request,
            opts.auth_data,
            cancel,
        )
        .await
    }

    /// Relay a raw WebSocket to the actor's websocket handler.
    ///
    /// # Errors
    ///
    /// Acquire or delivery errors; the session is not created.
    pub async fn on_raw_websocket(
        &self,
        opts: RawWebSocketOpts,
        socket: Arc<dyn ClientWebSocket>,
    ) -> Result<RawWebSocketSession, CoordinateError> {
        RawWebSocketSession::open(Arc::clone(&self.runtime), opts, socket).await
    }
}
