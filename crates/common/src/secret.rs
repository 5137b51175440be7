//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. The coordination layer keeps two
//! kinds of secret: the backend connection URL (which can embed a password)
//! and per-connection capability tokens handed to clients.
//!
//! `SecretString` implements `Debug` with redaction, so deriving `Debug` on a
//! struct that holds one is safe to log. The value is zeroized on drop.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct ConnCredentials {
//!     conn_id: String,
//!     conn_token: SecretString,
//! }
//!
//! let creds = ConnCredentials {
//!     conn_id: "c-1".to_string(),
//!     conn_token: SecretString::from("9f86d081884c7d65"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("9f86d081884c7d65"));
//! assert_eq!(creds.conn_token.expose_secret(), "9f86d081884c7d65");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@cache:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("token-abc");
        assert_eq!(secret.expose_secret(), "token-abc");
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Handshake {
            conn_id: String,
            conn_token: SecretString,
        }

        let json = r#"{"conn_id": "c-7", "conn_token": "deadbeef"}"#;
        let handshake: Handshake = serde_json::from_str(json).expect("deserialize");

        assert_eq!(handshake.conn_token.expose_secret(), "deadbeef");
        let debug = format!("{handshake:?}");
        assert!(debug.contains("c-7"));
        assert!(!debug.contains("deadbeef"));
    }
}
