//! Connection capability tokens.
//!
//! A relay connection gets a random token when it opens. The leader stores it
//! with the connection and checks it on every inbound message, so only the
//! node that opened the connection (or a client it handed the token to) can
//! speak for it.

use crate::errors::CoordinateError;
use common::secret::{ExposeSecret, SecretString};
use ring::{hmac, rand};

/// Random bytes per token (hex-encoded to twice this length).
const CONN_TOKEN_BYTES: usize = 32;

/// Generate a fresh connection token.
///
/// # Errors
///
/// Returns `CoordinateError::Internal` if the system RNG fails.
pub fn generate_conn_token() -> Result<SecretString, CoordinateError> {
    let rng = rand::SystemRandom::new();
    let mut bytes = [0u8; CONN_TOKEN_BYTES];
    rand::SecureRandom::fill(&rng, &mut bytes)
        .map_err(|_| CoordinateError::Internal("system RNG failure".to_string()))?;
    Ok(SecretString::from(hex::encode(bytes)))
}

/// Compare a presented token against the stored one in constant time.
///
/// Both sides are MACed under a throwaway key and compared with
/// `hmac::verify`, so timing does not depend on where the strings differ.
#[must_use]
pub fn verify_conn_token(expected: &SecretString, provided: &str) -> bool {
    let rng = rand::SystemRandom::new();
    let Ok(key) = hmac::Key::generate(hmac::HMAC_SHA256, &rng) else {
        return false;
    };
    let tag = hmac::sign(&key, expected.expose_secret().as_bytes());
    hmac::verify(&key, provided.as_bytes(), tag.as_ref()).is_ok()
}
