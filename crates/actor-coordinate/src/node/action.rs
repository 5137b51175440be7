//! Action round trip: run an actor action on whichever node leads it.

use super::publisher::{cancelled, publish_message_to_leader};
use crate::errors::{ActorError, CoordinateError};
use crate::peer::ActorPeer;
use crate::protocol::{LeaderAction, NodeMessageBody};
use crate::runtime::{lock, CoordinateRuntime};
use common::types::{ActorId, ConnId, RequestId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub actor_id: ActorId,
    pub action_name: String,
    pub args: Vec<Value>,
    pub params: Value,
    pub auth_data: Value,
}

/// Execute an action on the actor's leader and return its output.
///
/// Holds a temporary reference on the local peer for the duration so the
/// actor gets a leader even when no connection is open. The whole exchange,
/// delivery included, is bounded by `action_response_timeout`.
///
/// # Errors
///
/// - `CoordinateError::ActorFailed` with the actor's structured error
/// - `CoordinateError::ResponseTimeout` if no answer arrives in time
/// - Any acquire or delivery error
#[instrument(skip_all, fields(actor_id = %request.actor_id, action = %request.action_name))]
pub async fn publish_action_to_leader(
    runtime: &Arc<CoordinateRuntime>,
    request: ActionRequest,
    cancel: Option<&CancellationToken>,
) -> Result<Value, CoordinateError> {
    let reference = ConnId::new();
    let peer = ActorPeer::acquire(runtime, &request.actor_id, reference).await?;

    let request_id = RequestId::new();
    let (sender, receiver) = oneshot::channel();
    lock(&runtime.action_resolvers).insert(request_id, sender);

    let actor_id = request.actor_id.clone();
    let body = NodeMessageBody::LeaderAction(LeaderAction {
        request_id,
        actor_id: request.actor_id,
        action_name: request.action_name,
        action_args: request.args,
        params: request.params,
        auth_data: request.auth_data,
    });

    let exchange = async {
        publish_message_to_leader(runtime, &actor_id, body, cancel).await?;
        tokio::select! {
            () = cancelled(runtime, cancel) => Err(CoordinateError::Cancelled),
            response = receiver => response.map_err(|_| {
                CoordinateError::Internal("action resolver dropped".to_string())
            }),
        }
    };
    let result = tokio::time::timeout(runtime.config().action_response_timeout, exchange).await;

    lock(&runtime.action_resolvers).remove(&request_id);
    peer.remove_reference(reference).await;

    let response = result.map_err(|_| CoordinateError::ResponseTimeout("action"))??;
    if response.success {
        Ok(response.output.unwrap_or(Value::Null))
    } else {
        let error = response
            .error
            .unwrap_or_else(|| ActorError::internal("action failed without an error"));
        debug!(
            target: "coordinate.publisher",
            actor_id = %actor_id,
            code = %error.code,
            "Leader reported action failure"
        );
        Err(CoordinateError::ActorFailed(error))
    }
}
