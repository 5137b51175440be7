//! Common utilities and types shared across actor-coordinate crates.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes (nodes, actors, connections, messages)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
