//! HTTP fetch round trip to the actor's leader.

use super::publisher::{cancelled, publish_message_to_leader};
use crate::actor::{FetchRequest, FetchResponse};
use crate::errors::CoordinateError;
use crate::peer::ActorPeer;
use crate::protocol::{decode_body, encode_body, LeaderFetch, NodeMessageBody};
use crate::runtime::{lock, CoordinateRuntime};
use common::types::{ActorId, ConnId, RequestId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Forward `request` to the leader's fetch handler.
///
/// Bounded by `fetch_response_timeout`. Holds a temporary peer reference
/// like [`super::publish_action_to_leader`].
///
/// # Errors
///
/// - `CoordinateError::ActorFailed` if the leader could not serve the request
/// - `CoordinateError::ResponseTimeout` if no answer arrives in time
/// - Any acquire or delivery error
#[instrument(skip_all, fields(actor_id = %actor_id, method = %request.method))]
pub async fn publish_fetch_to_leader(
    runtime: &Arc<CoordinateRuntime>,
    actor_id: &ActorId,
    request: FetchRequest,
    auth_data: Value,
    cancel: Option<&CancellationToken>,
) -> Result<FetchResponse, CoordinateError> {
    let reference = ConnId::new();
    let peer = ActorPeer::acquire(runtime, actor_id, reference).await?;

    let request_id = RequestId::new();
    let (sender, receiver) = oneshot::channel();
    lock(&runtime.fetch_resolvers).insert(request_id, sender);

    let body = NodeMessageBody::LeaderFetch(LeaderFetch {
        request_id,
        actor_id: actor_id.clone(),
        method: request.method,
        url: request.url,
        headers: request.headers,
        body: encode_body(request.body.as_ref()),
        auth_data,
    });

    let exchange = async {
        publish_message_to_leader(runtime, actor_id, body, cancel).await?;
        tokio::select! {
            () = cancelled(runtime, cancel) => Err(CoordinateError::Cancelled),
            response = receiver => response.map_err(|_| {
                CoordinateError::Internal("fetch resolver dropped".to_string())
            }),
        }
    };
    let result = tokio::time::timeout(runtime.config().fetch_response_timeout, exchange).await;

    lock(&runtime.fetch_resolvers).remove(&request_id);
    peer.remove_reference(reference).await;

    let response = result.map_err(|_| CoordinateError::ResponseTimeout("fetch"))??;
    if let Some(error) = response.error {
        return Err(CoordinateError::ActorFailed(error));
    }
    Ok(FetchResponse {
        status: response.status,
        headers: response.headers,
        body: decode_body(response.body.as_deref())?,
    })
}
