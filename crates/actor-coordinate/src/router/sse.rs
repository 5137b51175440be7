use super::ConnectOpts;
use crate::errors::CoordinateError;
use crate::relay::{RelayConn, RelayTransport};
use crate::runtime::CoordinateRuntime;
use common::secret::SecretString;
use common::types::ConnId;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Lifecycle of one server-sent-events stream.
///
/// The stream is outbound only. The client sends through
/// [`super::ConnectionHandlers::on_conn_message`] using the id and token of
/// this session.
pub struct SseSession {
    runtime: Arc<CoordinateRuntime>,
    opts: ConnectOpts,
    conn: OnceLock<Arc<RelayConn>>,
}

impl SseSession {
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
                "sse session opened twice".to_string(),
            ));
        }
        conn.start().await
    }

    pub async fn on_close(&self) {
        match self.conn.get() {
            Some(conn) => conn.disconnect(false, None).await,
            None => debug!(
                target: "coordinate.router",
                actor_id = %self.opts.actor_id,
                "SSE stream closed before it opened"
            ),
        }
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.conn.get().map(|conn| conn.conn_id())
    }

    pub fn conn_token(&self) -> Option<&SecretString> {
        self.conn.get().map(|conn| conn.conn_token())
    }
}
