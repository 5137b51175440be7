//! Reliable delivery of node messages to an actor's leader.
//!
//! Each attempt resolves the current leader, publishes the message with a
//! `(sender, message id)` pair, and waits for the leader's `Ack`. Retryable
//! failures (backend errors, no live lease, missing ack) back off
//! exponentially and try again against a freshly resolved leader.
//!
//! The message id is fixed for the whole logical publish, so an ack for an
//! earlier attempt that arrives late still completes the current one.

use crate::driver::LeaderLookup;
use crate::errors::CoordinateError;
use crate::observability::metrics;
use crate::protocol::{NodeMessage, NodeMessageBody};
use crate::runtime::{lock, CoordinateRuntime};
use common::types::{ActorId, MessageId, NodeId};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// Publish `body` to the leader of `actor_id` and wait for its ack.
///
/// Returns the node that acknowledged the message.
///
/// # Errors
///
/// - `CoordinateError::ActorNotStarted` immediately if the actor was never created
/// - `CoordinateError::Cancelled` if `cancel` fires or the runtime shuts down
/// - `CoordinateError::RetriesExhausted` after `message_retries + 1` failed attempts
#[instrument(skip_all, fields(actor_id = %actor_id, tag = body.tag()))]
pub async fn publish_message_to_leader(
    runtime: &CoordinateRuntime,
    actor_id: &ActorId,
    body: NodeMessageBody,
    cancel: Option<&CancellationToken>,
) -> Result<NodeId, CoordinateError> {
    let config = runtime.config();
    let tag = body.tag();
    let attempts = config.message_retries.saturating_add(1);
    let message_id = MessageId::new();
    let mut backoff = config.retry_min_backoff;
    let mut attempt = 1;

    loop {
        metrics::record_publish_attempt(tag);

        let error = match publish_once(runtime, actor_id, &body, message_id, cancel).await {
            Ok(leader) => return Ok(leader),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        if attempt >= attempts {
            warn!(
                target: "coordinate.publisher",
                actor_id = %actor_id,
                message_id = %message_id,
                attempts = attempts,
                error = %error,
                "Giving up publishing to leader"
            );
            metrics::record_publish_exhausted(tag);
            return Err(CoordinateError::RetriesExhausted {
                attempts,
                source: Box::new(error),
            });
        }

        debug!(
            target: "coordinate.publisher",
            actor_id = %actor_id,
            message_id = %message_id,
            attempt = attempt,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Publish to leader failed, retrying"
        );
        metrics::record_publish_retry(tag);

        tokio::select! {
            () = cancelled(runtime, cancel) => return Err(CoordinateError::Cancelled),
            () = tokio::time::sleep(backoff) => {}
        }

        backoff = backoff.saturating_mul(2).min(config.retry_max_backoff);
        attempt += 1;
    }
}

/// One delivery attempt. Retryable failures become `LeaderChanged`.
///
/// For traffic where a retry could reorder messages, such as raw WebSocket
/// frames. The caller is expected to close the stream and let the client
/// reconnect.
///
/// # Errors
///
/// `CoordinateError::LeaderChanged` if the leader could not be reached, or
/// the underlying non-retryable error.
pub async fn publish_message_to_leader_no_retry(
    runtime: &CoordinateRuntime,
    actor_id: &ActorId,
    body: NodeMessageBody,
    cancel: Option<&CancellationToken>,
) -> Result<NodeId, CoordinateError> {
    metrics::record_publish_attempt(body.tag());
    match publish_once(runtime, actor_id, &body, MessageId::new(), cancel).await {
        Ok(leader) => Ok(leader),
        Err(e) if e.is_retryable() => {
            debug!(
                target: "coordinate.publisher",
                actor_id = %actor_id,
                error = %e,
                "Single-attempt publish failed"
            );
            Err(CoordinateError::LeaderChanged(actor_id.clone()))
        }
        Err(e) => Err(e),
    }
}

async fn publish_once(
    runtime: &CoordinateRuntime,
    actor_id: &ActorId,
    body: &NodeMessageBody,
    message_id: MessageId,
    cancel: Option<&CancellationToken>,
) -> Result<NodeId, CoordinateError> {
    let leader = match runtime.driver().get_leader(actor_id).await? {
        LeaderLookup::NotStarted => {
            return Err(CoordinateError::ActorNotStarted(actor_id.clone()))
        }
        LeaderLookup::Unleased => return Err(CoordinateError::NotLeased(actor_id.clone())),
        LeaderLookup::Leader(node_id) => node_id,
    };

    let payload = NodeMessage::acked(runtime.node_id(), message_id, body.clone()).encode()?;

    let (sender, receiver) = oneshot::channel();
    lock(&runtime.ack_resolvers).insert(message_id, sender);

    let started = Instant::now();
    let outcome = async {
        runtime.driver().publish_to_node(leader, payload).await?;
        trace!(
            target: "coordinate.publisher",
            message_id = %message_id,
            node_id = %leader,
            "Published, awaiting ack"
        );

        tokio::select! {
            () = cancelled(runtime, cancel) => Err(CoordinateError::Cancelled),
            ack = tokio::time::timeout(runtime.config().message_ack_timeout, receiver) => match ack {
                Ok(Ok(())) => Ok(leader),
                Ok(Err(_)) => Err(CoordinateError::Internal("ack resolver dropped".to_string())),
                Err(_) => Err(CoordinateError::AckTimeout { message_id }),
            },
        }
    }
    .await;

    lock(&runtime.ack_resolvers).remove(&message_id);

    if outcome.is_ok() {
        metrics::record_ack_latency(started.elapsed());
    }
    outcome
}

/// Resolves when `cancel` fires or the runtime shuts down.
pub(super) async fn cancelled(runtime: &CoordinateRuntime, cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => {
            tokio::select! {
                () = token.cancelled() => {}
                () = runtime.shutdown_token().cancelled() => {}
            }
        }
        None => runtime.shutdown_token().cancelled().await,
    }
}
