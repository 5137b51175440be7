use super::ConnectOpts;
use crate::errors::CoordinateError;
use crate::relay::{RelayConn, RelayTransport};
use crate::runtime::CoordinateRuntime;
use common::types::ConnId;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Lifecycle of one WebSocket connection.
///
/// `on_open` once, then any number of `on_message`, then `on_close`.
pub struct WebSocketSession {
    runtime: Arc<CoordinateRuntime>,
    opts: ConnectOpts,
    conn: OnceLock<Arc<RelayConn>>,
}

impl WebSocketSession {
    pub(super) fn new(runtime: Arc<CoordinateRuntime>, opts: ConnectOpts) -> Self {
        Self {
            runtime,
            opts,
            conn: OnceLock::new(),
        }
    }

    /// # Errors
    ///
    /// Returns the open failure; `transport` has been disconnected by then.
    pub async fn on_open(&self, transport: Arc<dyn RelayTransport>) -> Result<(), CoordinateError> {
        let conn = RelayConn::new(
            Arc::clone(&self.runtime),
            transport,
            self.opts.actor_id.clone(),
            self.opts.params.clone(),
            self.opts.auth_data.clone(),
        )?;
        if self.conn.set(Arc::clone(&conn)).is_err() {
            return Err(CoordinateError::Internal(
                "websocket session opened twice".to_string(),
            ));
        }
        conn.start().await
    }

    /// # Errors
    ///
    /// `CoordinateError::ConnNotReady` before `on_open`, otherwise delivery errors.
    pub async fn on_message(&self, message: Value) -> Result<(), CoordinateError> {
        let conn = self.conn.get().ok_or(CoordinateError::ConnNotReady)?;
        conn.send_to_leader(message).await
    }

    pub async fn on_close(&self) {
        match self.conn.get() {
            Some(conn) => conn.disconnect(false, None).await,
            None => debug!(
                target: "coordinate.router",
                actor_id = %self.opts.actor_id,
                "WebSocket closed before it opened"
            ),
        }
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.conn.get().map(|conn| conn.conn_id())
    }
}
