//! Pub/sub and lease backend contract.
//!
//! Every lease operation must be a single atomic backend operation. A
//! read-then-write lease implementation lets two nodes both believe they lead.

mod lua_scripts;
mod memory;
mod redis;

pub use memory::MemoryCoordinateDriver;
pub use self::redis::RedisCoordinateDriver;

use crate::errors::CoordinateError;
use async_trait::async_trait;
use bytes::Bytes;
use common::types::{ActorId, NodeId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Raw messages published to this node, in arrival order.
pub type NodeSubscriber = mpsc::UnboundedReceiver<Bytes>;

/// Persisted description of an actor, written when the actor is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorMetadata {
    pub name: String,
    #[serde(default)]
    pub key: Vec<String>,
}

/// Result of [`CoordinateDriver::start_and_acquire_lease`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub metadata: ActorMetadata,
    /// Current holder: the caller if it just acquired, otherwise the existing leader.
    pub leader_node_id: NodeId,
}

/// Result of [`CoordinateDriver::get_leader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderLookup {
    /// The actor was never created.
    NotStarted,
    /// The actor exists but no lease is live.
    Unleased,
    Leader(NodeId),
}

#[async_trait]
pub trait CoordinateDriver: Send + Sync + 'static {
    /// Subscribe to `node_id`'s channel. The subscription lives until the
    /// receiver is dropped.
    async fn create_node_subscriber(&self, node_id: NodeId)
        -> Result<NodeSubscriber, CoordinateError>;

    /// Best-effort, at-most-once delivery to `target`.
    async fn publish_to_node(&self, target: NodeId, message: Bytes)
        -> Result<(), CoordinateError>;

    async fn get_leader(&self, actor_id: &ActorId) -> Result<LeaderLookup, CoordinateError>;

    /// Read the actor's metadata and take the lease if nobody holds it, in one
    /// atomic step. `None` if the actor has no metadata.
    async fn start_and_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<Option<LeaseGrant>, CoordinateError>;

    /// Extend the lease iff `node_id` still holds it.
    async fn extend_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<bool, CoordinateError>;

    /// Take the lease if absent or expired; returns whoever holds it afterwards.
    async fn attempt_acquire_lease(
        &self,
        actor_id: &ActorId,
        node_id: NodeId,
        lease_duration: Duration,
    ) -> Result<NodeId, CoordinateError>;

    /// Delete the lease iff `node_id` holds it.
    async fn release_lease(&self, actor_id: &ActorId, node_id: NodeId)
        -> Result<(), CoordinateError>;
}
