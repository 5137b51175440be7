//! # Coordinate Test Utilities
//!
//! Mocks and fixtures for exercising `actor-coordinate` without Redis.
//!
//! ## Modules
//!
//! - `mock_actor` - Scriptable [`actor_coordinate::actor::LeaderActor`] that records what it sees
//! - `mock_transport` - Client-side transports that capture relayed traffic
//! - `fixtures` - Multi-node clusters over one shared in-memory driver
//!
//! ## Usage
//!
//! ```rust,ignore
//! use coordinate_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let cluster = TestCluster::start(2).await;
//!     let actor_id = cluster.create_actor("room-1");
//!
//!     let transport = MockTransport::new();
//!     let session = cluster.node(1).runtime.handlers().on_connect_websocket(
//!         ConnectOpts { actor_id, params: json!({}), auth_data: json!(null) },
//!     );
//!     session.on_open(transport.clone()).await.unwrap();
//!     let init = transport.next_message().await;
//!     // ...
//!     cluster.shutdown().await;
//! }
//! ```

pub mod fixtures;
pub mod mock_actor;
pub mod mock_transport;

pub use fixtures::*;
pub use mock_actor::*;
pub use mock_transport::*;
