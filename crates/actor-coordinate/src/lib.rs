//! Actor Coordinate Library
//!
//! Distributed coordination for an actor runtime: each actor is led by
//! exactly one node at a time, and clients connected to any node reach it
//! through that leader.
//!
//! - Leader election through expiring leases in a shared backend
//! - Node-to-node messages over pub/sub with acknowledgement and retry
//! - Relay of client connections (WebSocket, SSE), actions, HTTP fetches and
//!   raw WebSockets from the node holding the client to the leader
//!
//! # Architecture
//!
//! ```text
//! client ──► ConnectionHandlers ──► RelayConn ──► publisher ──┐
//!                                      ▲                       │ pub/sub
//!                                      │                       ▼
//!                      follower handlers ◄── dispatcher ◄── leader node
//!                                                          │
//!                                              ActorPeer ──► LeaderActor
//! ```
//!
//! Every node runs one [`runtime::CoordinateRuntime`]. Per actor, a node holds
//! at most one [`peer::ActorPeer`], alive while local connections reference
//! it. The peer's heartbeat renews the lease (leader) or tries to take it
//! over (follower).
//!
//! # Key Design Decisions
//!
//! - **Lease is the only truth**: cached leader ids may lag; the publisher
//!   resolves the leader on every attempt
//! - **At-least-once delivery**: leaders must tolerate duplicate messages
//! - **Backend behind a trait**: [`driver::CoordinateDriver`] has a Redis
//!   implementation and an in-process one used for tests
//!
//! # Modules
//!
//! - [`actor`] - Interface of the hosted actor
//! - [`config`] - Configuration from environment
//! - [`driver`] - Lease and pub/sub backends
//! - [`errors`] - Error types
//! - [`protocol`] - Node message wire format
//! - [`router`] - Transport entry points

pub mod actor;
pub mod config;
pub mod driver;
pub mod errors;
pub mod node;
pub mod observability;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod runtime;
pub mod token;

pub use runtime::CoordinateRuntime;
