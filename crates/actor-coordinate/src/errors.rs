//! Coordination error types.
//!
//! `CoordinateError::is_retryable` decides what the reliable publisher
//! retries. `client_message` is what may be shown to an end user; backend
//! details stay in the logs.

use crate::config::ConfigError;
use common::types::{ActorId, MessageId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by an actor implementation.
///
/// Travels back to the requesting node inside action and fetch responses, so
/// callers can tell "the actor failed" apart from "the message was lost".
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ActorError {
    /// Machine-readable error code.
    #[serde(rename = "c")]
    pub code: String,
    /// Human-readable description.
    #[serde(rename = "m")]
    pub message: String,
}

impl ActorError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    pub fn unsupported(feature: &str) -> Self {
        Self::new("unsupported", format!("{feature} is not supported by this actor"))
    }
}

/// Coordination error type.
#[derive(Debug, Error)]
pub enum CoordinateError {
    /// Lease/pub-sub backend operation failed.
    #[error("Driver error: {0}")]
    Driver(String),

    /// A node message could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The actor has no metadata in the backend.
    #[error("Actor not found: {0}")]
    ActorNotFound(ActorId),

    /// Leader lookup found no record of the actor ever being started.
    #[error("Actor not started: {0}")]
    ActorNotStarted(ActorId),

    /// The actor exists but nobody holds its lease right now.
    #[error("Actor not leased yet: {0}")]
    NotLeased(ActorId),

    /// The leader did not acknowledge a message in time.
    #[error("Message {message_id} was not acknowledged")]
    AckTimeout { message_id: MessageId },

    /// An action or fetch was acknowledged but never answered.
    #[error("Timed out waiting for {0} response")]
    ResponseTimeout(&'static str),

    /// The originating request went away.
    #[error("Operation cancelled")]
    Cancelled,

    /// Every delivery attempt failed.
    #[error("Delivery failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<CoordinateError>,
    },

    /// A single-attempt publish failed, typically because leadership moved.
    #[error("Actor leader changed: {0}")]
    LeaderChanged(ActorId),

    /// The actor reported an error.
    #[error("Actor error: {0}")]
    ActorFailed(ActorError),

    /// A session adapter was used before its connection was opened.
    #[error("Connection not ready")]
    ConnNotReady,

    /// The actor peer was disposed while the operation was running.
    #[error("Actor peer disposed: {0}")]
    PeerDisposed(ActorId),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinateError {
    /// Whether the reliable publisher should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinateError::Driver(_)
                | CoordinateError::NotLeased(_)
                | CoordinateError::AckTimeout { .. }
        )
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            CoordinateError::Driver(_)
            | CoordinateError::Protocol(_)
            | CoordinateError::Config(_)
            | CoordinateError::Internal(_) => "An internal error occurred".to_string(),
            CoordinateError::ActorNotFound(_) | CoordinateError::ActorNotStarted(_) => {
                "Actor not found".to_string()
            }
            CoordinateError::NotLeased(_)
            | CoordinateError::AckTimeout { .. }
            | CoordinateError::RetriesExhausted { .. }
            | CoordinateError::ResponseTimeout(_) => {
                "Actor is unavailable, please try again".to_string()
            }
            CoordinateError::LeaderChanged(_) | CoordinateError::PeerDisposed(_) => {
                "Actor moved, please reconnect".to_string()
            }
            CoordinateError::Cancelled => "Request cancelled".to_string(),
            CoordinateError::ConnNotReady => "Connection not ready".to_string(),
            CoordinateError::ActorFailed(e) => e.message.clone(),
        }
    }
}

impl From<ActorError> for CoordinateError {
    fn from(err: ActorError) -> Self {
        CoordinateError::ActorFailed(err)
    }
}

impl From<ConfigError> for CoordinateError {
    fn from(err: ConfigError) -> Self {
        CoordinateError::Config(err.to_string())
    }
}
