//! Identifier types for the coordination layer.
//!
//! Random identifiers (`NodeId`, `ConnId`, `MessageId`, `RequestId`,
//! `WebSocketId`) wrap a v4 `Uuid` and serialize as the plain hyphenated
//! string. `ActorId` is assigned by whoever creates the actor and is opaque.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an identifier from its string form
            ///
            /// # Errors
            ///
            /// Returns an error if `value` is not a valid UUID.
            pub fn parse(value: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(value).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one coordinating process. Generated at startup, never persisted.
    NodeId
);

uuid_id!(
    /// Identifier of one client connection, generated by the node that accepted it
    ConnId
);

uuid_id!(
    /// Identifier of a node message that requests acknowledgement
    MessageId
);

uuid_id!(
    /// Identifier correlating an action or fetch request with its response
    RequestId
);

uuid_id!(
    /// Identifier of a relayed raw WebSocket
    WebSocketId
);

/// Stable identifier of a durable actor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ActorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
