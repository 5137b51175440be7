//! Redis coordinate driver.
//!
//! # Key Patterns
//!
//! - `{prefix}:actor:{id}:metadata` - Actor metadata (JSON), written once on creation
//! - `{prefix}:actor:{id}:lease` - Holder node id, expires via `PX`
//! - `{prefix}:node:{node_id}` - Pub/sub channel of one node
//!
//! # Connection Pattern
//!
//! Commands go through a `MultiplexedConnection`, which is cheap to clone and
//! safe to use concurrently, so each operation clones it instead of locking.
//! Each node subscription owns a dedicated pub/sub connection, reopened with
//! backoff when the stream ends.

use super::lua_scripts;
use super::{ActorMetadata, CoordinateDriver, LeaderLookup, LeaseGrant, NodeSubscriber};
use crate::errors::CoordinateError;
use async_trait::async_trait;
use bytes::Bytes;
use common::secret::{ExposeSecret, SecretString};
use common::types::{ActorId, NodeId};
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

const RESUBSCRIBE_MIN_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Redis-backed lease store and message bus.
///
/// Cheaply cloneable; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisCoordinateDriver {
    /// Used to open dedicated pub/sub connections.
    client: Client,
    connection: MultiplexedConnection,
    key_prefix: String,
    acquire_script: Script,
    extend_script: Script,
    release_script: Script,
    start_script: Script,
}

impl RedisCoordinateDriver {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CoordinateError::Driver` if the client cannot be opened or the
    /// connection fails.
    pub async fn new(redis_url: &SecretString, key_prefix: &str) -> Result<Self, CoordinateError> {
        let client = Client::open(redis_url.expose_secret()).map_err(|e| {
            // Do not log redis_url: it may carry a password
            error!(
                target: "coordinate.driver.redis",
                error = %e,
                "Failed to open Redis client"
            );
            CoordinateError::Driver(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "coordinate.driver.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                CoordinateError::Driver(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            key_prefix: key_prefix.to_string(),
            acquire_script: Script::new(lua_scripts::ACQUIRE_LEASE),
            extend_script: Script::new(lua_scripts::EXTEND_LEASE),
            release_script: Script::new(lua_scripts::RELEASE_LEASE),
            start_script: Script::new(lua_scripts::START_AND_ACQUIRE_LEASE),
        })
    }

    fn metadata_key(&self, actor_id: &ActorId) -> String {
        format!("{}:actor:{actor_id}:metadata", self.key_prefix)
    }

    fn lease_key(&self, actor_id: &ActorId) -> String {
        format!("{}:actor:{actor_id}:lease", self.key_prefix)
    }

    fn node_channel(&self, node_id: NodeId) -> String {
        format!("{}:node:{node_id}", self.key_prefix)
    }

    /// Record actor metadata. Returns `false` if the actor already exists.
    #[instrument(skip_all, fields(actor_id = %actor_id))]
    pub async fn create_actor(
        &self,
        actor_id: &ActorId,
        metadata: &ActorMetadata,
    ) -> Result<bool, CoordinateError> {
        let json = serde_json::to_string(metadata).map_err(|e| {
            CoordinateError::Internal(format!("serialization failed: {e}"))
        })?;

        let mut conn = self.connection.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(self.metadata_key(actor_id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("create actor", actor_id, &e))?;

        Ok(created.is_some())
    }
}

fn redis_error(operation: &str, actor_id: &ActorId, e: &redis::RedisError) -> CoordinateError {
    warn!(
        target: "coordinate.driver.redis",
        error = %e,
        actor_id = %actor_id,
        operation = operation,
        "Redis lease operation failed"
    );
    CoordinateError::Driver(format!("Failed to {operation}: {e}"))
}

/// Open a dedicated pub/sub connection subscribed to `channel`.
async fn subscribe(client: &Client, channel: &str) -> Result<PubSub, CoordinateError> {
    let mut pubsub = client.get_async_pubsub().await.map_err(|e| {
        error!(
            target: "coordinate.driver.redis",
            error = %e,
            "Failed to open pub/sub connection"
        );
        CoordinateError::Driver(format!("Failed to open pub/sub connection: {e}"))
    })?;
    pubsub.subscribe(channel).await.map_err(|e| {
        error!(
            target: "coordinate.driver.redis",
            error = %e,
            channel = %channel,
            "Failed to subscribe to node channel"
        );
        CoordinateError::Driver(format!("Failed to subscribe: {e}"))
    })?;
    Ok(pubsub)
}

/// Retry [`subscribe`] with capped exponential backoff until it succeeds or
/// the node subscriber goes away. Messages published in the gap are lost;
/// senders retry unacknowledged ones.
async fn resubscribe(
    client: &Client,
    channel: &str,
    sender: &mpsc::UnboundedSender<Bytes>,
) -> Option<PubSub> {
    let mut backoff = RESUBSCRIBE_MIN_BACKOFF;
    loop {
        tokio::select! {
            () = sender.closed() => return None,
            () = tokio::time::sleep(backoff) => {}
        }
        match subscribe(client, channel).await {
            Ok(pubsub) => {
                info!(
                    target: "coordinate.driver.redis",
                    channel = %channel,
                    "Resubscribed to node channel"
                );
                return Some(pubsub);
            }
            Err(_) => backoff = backoff.saturating_mul(2).min(RESUBSCRIBE_MAX_BACKOFF),
        }
    }
}

fn parse_node_id(raw: &str) -> Result<NodeId, CoordinateError> {
    NodeId::parse(raw)
        .map_err(|e| CoordinateError::Driver(format!("Invalid lease holder {raw:?}: {e}")))
}

fn lease_millis(lease_duration: Duration) -> u64 {
    u64::try_from(lease_duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CoordinateDriver for RedisCoordinateDriver {
    #[instrument(skip_all, fields(node_id = %node_id))]
    async fn create_node_subscriber(
        &self,
        node_id: NodeId,
    ) -> Result<NodeSubscriber, CoordinateError> {
        let channel = self.node_channel(node_id);
        let pubsub = subscribe(&self.client, &channel).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut pubsub = pubsub;
            loop {
                let mut messages = Box::pin(pubsub.into_on_message());
                while let Some(msg) = messages.next().await {
                    let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                    if sender.send(payload).is_err() {
                        debug!(
                            target: "coordinate.driver.redis",
                            channel = %channel,
                            "Node subscriber dropped, closing pub/sub connection"
                        );
                        return;
                    }
                }
                warn!(
                    target: "coordinate.driver.redis",
                    channel = %channel,
                    "Pub/sub stream ended, resubscribing"
                );
                match resubscribe(&client, &channel, &sender).await {
                    Some(next) => pubsub = next,
                    None => return,
                }
            }
        });

        Ok(receiver)
    }

    async fn publish_to_node(
        &self,
        target: NodeId,
        message: Bytes,
    ) -> Result<(), CoordinateError> {
        let mut conn = self.connection.clone();
        let _receivers: i64 = conn
            .publish(self.node_channel(target), message.as_ref())
            .await
            .map_err(|e| {
                warn!(
                    target: "coordinate.driver.redis",
                    error = %e,
                    node_id = %target,
                    "Failed to publish to node"
                );
                CoordinateError::Driver(format!("Failed to publish: {e}"))
            })?;
        Ok(())
    }

    #[instrument(skip_all, fields(actor_id = %actor_id))]
    async fn get_leader(&self, actor_id: &ActorId) -> Result<LeaderLookup, CoordinateError> {
        let mut conn = self.connection.clone();
        let (metadata, holder): (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(self.metadata_key(actor_id))
            .arg(self.lease_key(actor_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("get leader", actor_id, &e))?;

        match (metadata, holder) {
            (None, _) => Ok(LeaderLookup::NotStarted),
            (Some(_), None) => Ok(LeaderLookup::Unleased),
            (Some(_), Some(holder)) => parse_node_id(&holder).map(LeaderLookup::Leader),
        }
    }

    #[instrument(skip_all, fields(actor_id = %actor_id, node_id = %node_id))]
    async fn start_and_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<Option<LeaseGrant>, CoordinateError> {
        let mut conn = self.connection.clone();
        let result: Option<(String, String)> = self
            .start_script
            .key(self.metadata_key(actor_id))
            .key(self.lease_key(actor_id))
            .arg(node_id.to_string())
            .arg(lease_millis(lease_duration))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("start and acquire lease", actor_id, &e))?;

        let Some((metadata, holder)) = result else {
            return Ok(None);
        };

        let metadata: ActorMetadata = serde_json::from_str(&metadata).map_err(|e| {
            error!(
                target: "coordinate.driver.redis",
                error = %e,
                actor_id = %actor_id,
                "Failed to deserialize actor metadata"
            );
            CoordinateError::Driver(format!("Failed to deserialize actor metadata: {e}"))
        })?;

        Ok(Some(LeaseGrant {
            metadata,
            leader_node_id: parse_node_id(&holder)?,
        }))
    }

    async fn extend_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<bool, CoordinateError> {
        let mut conn = self.connection.clone();
        let result: i64 = self
            .extend_script
            .key(self.lease_key(actor_id))
            .arg(node_id.to_string())
            .arg(lease_millis(lease_duration))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("extend lease", actor_id, &e))?;

        Ok(result == 1)
    }

    async fn attempt_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<NodeId, CoordinateError> {
        let mut conn = self.connection.clone();
        let holder: String = self
            .acquire_script
            .key(self.lease_key(actor_id))
            .arg(node_id.to_string())
            .arg(lease_millis(lease_duration))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("acquire lease", actor_id, &e))?;

        parse_node_id(&holder)
    }

    async fn release_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
    ) -> Result<(), CoordinateError> {
        let mut conn = self.connection.clone();
        let released: i64 = self
            .release_script
            .key(self.lease_key(actor_id))
            .arg(node_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("release lease", actor_id, &e))?;

        debug!(
            target: "coordinate.driver.redis",
            actor_id = %actor_id,
            released = released == 1,
            "Released lease"
        );
        Ok(())
    }
}
