//! Client-side transports that capture everything relayed to them.

use actor_coordinate::errors::CoordinateError;
use actor_coordinate::protocol::WsPayload;
use actor_coordinate::relay::{ClientWebSocket, RelayTransport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long `next_*` helpers wait before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Captures messages for one WebSocket or SSE client.
pub struct MockTransport {
    sender: mpsc::UnboundedSender<Value>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    /// `Some(reason)` once disconnected.
    disconnected: Mutex<Option<Option<String>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            disconnected: Mutex::new(None),
        })
    }

    /// Next message delivered to the client. Panics after [`RECV_TIMEOUT`].
    pub async fn next_message(&self) -> Value {
        self.try_next_message(RECV_TIMEOUT)
            .await
            .expect("no message delivered to client")
    }

    pub async fn try_next_message(&self, within: Duration) -> Option<Value> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(within, receiver.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.lock().unwrap().is_some()
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnected.lock().unwrap().clone().flatten()
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn send_message(&self, message: Value) -> Result<(), CoordinateError> {
        self.sender
            .send(message)
            .map_err(|_| CoordinateError::Internal("mock transport closed".to_string()))
    }

    async fn disconnect(&self, reason: Option<String>) -> Result<(), CoordinateError> {
        self.disconnected.lock().unwrap().get_or_insert(reason);
        Ok(())
    }
}

/// Captures frames for one raw WebSocket client.
pub struct MockClientWebSocket {
    sender: mpsc::UnboundedSender<WsPayload>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<WsPayload>>,
    closed: Mutex<Option<(Option<u16>, Option<String>)>>,
}

impl MockClientWebSocket {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            closed: Mutex::new(None),
        })
    }

    pub async fn next_frame(&self) -> WsPayload {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(RECV_TIMEOUT, receiver.recv())
            .await
            .ok()
            .flatten()
            .expect("no frame delivered to client")
    }

    /// `(code, reason)` if the socket was closed.
    pub fn close_frame(&self) -> Option<(Option<u16>, Option<String>)> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientWebSocket for MockClientWebSocket {
    async fn send(&self, payload: WsPayload) -> Result<(), CoordinateError> {
        self.sender
            .send(payload)
            .map_err(|_| CoordinateError::Internal("mock websocket closed".to_string()))
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), CoordinateError> {
        self.closed.lock().unwrap().get_or_insert((code, reason));
        Ok(())
    }
}
