//! Node-to-node wire protocol.
//!
//! Every pub/sub payload is a JSON [`NodeMessage`]:
//!
//! ```text
//! { "n": <sender node id>?, "m": <message id>?, "b": { "<tag>": { ...fields } } }
//! ```
//!
//! A message carrying both `n` and `m` asks the receiver to reply
//! `{"b":{"a":{"m":<message id>}}}` to `n`. Field names are kept short since
//! every byte goes through the pub/sub backend. Tags prefixed `l` travel
//! follower to leader, tags prefixed `f` travel leader to follower.

use crate::errors::{ActorError, CoordinateError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use common::types::{ActorId, ConnId, MessageId, NodeId, RequestId, WebSocketId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// HTTP-style header map carried by fetch and WebSocket messages.
pub type Headers = BTreeMap<String, String>;

/// Envelope of all node-to-node traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMessage {
    /// Node to acknowledge to.
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub sender_node_id: Option<NodeId>,
    /// Present when the sender wants an acknowledgement.
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(rename = "b")]
    pub body: NodeMessageBody,
}

impl NodeMessage {
    /// Fire-and-forget message.
    pub fn unacked(body: NodeMessageBody) -> Self {
        Self {
            sender_node_id: None,
            message_id: None,
            body,
        }
    }

    /// Message the receiver must acknowledge back to `sender`.
    pub fn acked(sender: NodeId, message_id: MessageId, body: NodeMessageBody) -> Self {
        Self {
            sender_node_id: Some(sender),
            message_id: Some(message_id),
            body,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CoordinateError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CoordinateError::Protocol(format!("failed to encode node message: {e}")))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CoordinateError> {
        serde_json::from_slice(raw)
            .map_err(|e| CoordinateError::Protocol(format!("failed to decode node message: {e}")))
    }
}

/// Closed set of message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeMessageBody {
    #[serde(rename = "a")]
    Ack(Ack),
    #[serde(rename = "lco")]
    LeaderConnOpen(LeaderConnOpen),
    #[serde(rename = "lcc")]
    LeaderConnClose(LeaderConnClose),
    #[serde(rename = "lm")]
    LeaderMsg(LeaderMsg),
    #[serde(rename = "la")]
    LeaderAction(LeaderAction),
    #[serde(rename = "lf")]
    LeaderFetch(LeaderFetch),
    #[serde(rename = "lwo")]
    LeaderWsOpen(LeaderWsOpen),
    #[serde(rename = "lwm")]
    LeaderWsMsg(WsFrame),
    #[serde(rename = "lwc")]
    LeaderWsClose(WsClose),
    #[serde(rename = "fcc")]
    FollowerConnClose(FollowerConnClose),
    #[serde(rename = "fm")]
    FollowerMsg(FollowerMsg),
    #[serde(rename = "far")]
    FollowerActionResp(FollowerActionResp),
    #[serde(rename = "ffr")]
    FollowerFetchResp(FollowerFetchResp),
    #[serde(rename = "fwo")]
    FollowerWsOpen(FollowerWsOpen),
    #[serde(rename = "fwm")]
    FollowerWsMsg(WsFrame),
    #[serde(rename = "fwc")]
    FollowerWsClose(WsClose),
}

impl NodeMessageBody {
    /// Wire tag, used as a low-cardinality label in logs and metrics.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeMessageBody::Ack(_) => "a",
            NodeMessageBody::LeaderConnOpen(_) => "lco",
            NodeMessageBody::LeaderConnClose(_) => "lcc",
            NodeMessageBody::LeaderMsg(_) => "lm",
            NodeMessageBody::LeaderAction(_) => "la",
            NodeMessageBody::LeaderFetch(_) => "lf",
            NodeMessageBody::LeaderWsOpen(_) => "lwo",
            NodeMessageBody::LeaderWsMsg(_) => "lwm",
            NodeMessageBody::LeaderWsClose(_) => "lwc",
            NodeMessageBody::FollowerConnClose(_) => "fcc",
            NodeMessageBody::FollowerMsg(_) => "fm",
            NodeMessageBody::FollowerActionResp(_) => "far",
            NodeMessageBody::FollowerFetchResp(_) => "ffr",
            NodeMessageBody::FollowerWsOpen(_) => "fwo",
            NodeMessageBody::FollowerWsMsg(_) => "fwm",
            NodeMessageBody::FollowerWsClose(_) => "fwc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "m")]
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderConnOpen {
    #[serde(rename = "ai")]
    pub actor_id: ActorId,
    #[serde(rename = "ci")]
    pub conn_id: ConnId,
    #[serde(rename = "ct")]
    pub conn_token: String,
    #[serde(rename = "p", default)]
    pub params: Value,
    #[serde(rename = "ad", default)]
    pub auth_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderConnClose {
    #[serde(rename = "ai")]
    pub actor_id: ActorId,
    #[serde(rename = "ci")]
    pub conn_id: ConnId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderMsg {
    #[serde(rename = "ai")]
    pub actor_id: ActorId,
    #[serde(rename = "ci")]
    pub conn_id: ConnId,
    #[serde(rename = "ct")]
    pub conn_token: String,
    #[serde(rename = "m")]
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderAction {
    #[serde(rename = "ri")]
    pub request_id: RequestId,
    #[serde(rename = "ai")]
    pub actor_id: ActorId,
    #[serde(rename = "an")]
    pub action_name: String,
    #[serde(rename = "aa", default)]
    pub action_args: Vec<Value>,
    #[serde(rename = "p", default)]
    pub params: Value,
    #[serde(rename = "ad", default)]
    pub auth_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderFetch {
    #[serde(rename = "ri")]
    pub request_id: RequestId,
    #[serde(rename = "ai")]
    pub actor_id: ActorId,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    /// Base64 request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "ad", default)]
    pub auth_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderWsOpen {
    #[serde(rename = "ai")]
    pub actor_id: ActorId,
    #[serde(rename = "wi")]
    pub websocket_id: WebSocketId,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(rename = "ad", default)]
    pub auth_data: Value,
}

/// One WebSocket frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "wi")]
    pub websocket_id: WebSocketId,
    /// Text, or base64 when `binary` is set.
    pub data: String,
    #[serde(default)]
    pub binary: bool,
}

impl WsFrame {
    pub fn new(websocket_id: WebSocketId, payload: &WsPayload) -> Self {
        match payload {
            WsPayload::Text(text) => Self {
                websocket_id,
                data: text.clone(),
                binary: false,
            },
            WsPayload::Binary(bytes) => Self {
                websocket_id,
                data: STANDARD.encode(bytes),
                binary: true,
            },
        }
    }

    pub fn payload(&self) -> Result<WsPayload, CoordinateError> {
        if self.binary {
            decode_base64(&self.data).map(WsPayload::Binary)
        } else {
            Ok(WsPayload::Text(self.data.clone()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsClose {
    #[serde(rename = "wi")]
    pub websocket_id: WebSocketId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerConnClose {
    #[serde(rename = "ci")]
    pub conn_id: ConnId,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerMsg {
    #[serde(rename = "ci")]
    pub conn_id: ConnId,
    #[serde(rename = "m")]
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerActionResp {
    #[serde(rename = "ri")]
    pub request_id: RequestId,
    #[serde(rename = "s")]
    pub success: bool,
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActorError>,
}

impl FollowerActionResp {
    pub fn from_result(request_id: RequestId, result: Result<Value, ActorError>) -> Self {
        match result {
            Ok(output) => Self {
                request_id,
                success: true,
                output: Some(output),
                error: None,
            },
            Err(error) => Self {
                request_id,
                success: false,
                output: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerFetchResp {
    #[serde(rename = "ri")]
    pub request_id: RequestId,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    /// Base64 response body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActorError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerWsOpen {
    #[serde(rename = "wi")]
    pub websocket_id: WebSocketId,
}

/// Decoded WebSocket frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsPayload {
    Text(String),
    Binary(Bytes),
}

pub fn encode_body(body: Option<&Bytes>) -> Option<String> {
    body.map(|b| STANDARD.encode(b))
}

pub fn decode_body(body: Option<&str>) -> Result<Option<Bytes>, CoordinateError> {
    body.map(decode_base64).transpose()
}

fn decode_base64(data: &str) -> Result<Bytes, CoordinateError> {
    STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| CoordinateError::Protocol(format!("invalid base64 payload: {e}")))
}
