//! Coordination configuration.
//!
//! Configuration is loaded from environment variables. The Redis URL is
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default key prefix for lease, metadata and channel names.
pub const DEFAULT_KEY_PREFIX: &str = "coordinate";

/// Default lease TTL in milliseconds.
pub const DEFAULT_LEASE_DURATION_MS: u64 = 3000;

/// Default margin before lease expiry at which the leader renews.
pub const DEFAULT_RENEW_LEASE_GRACE_MS: u64 = 1500;

/// Default follower lease check interval in milliseconds.
pub const DEFAULT_CHECK_LEASE_INTERVAL_MS: u64 = 1000;

/// Default upper bound of the random delay added to each follower check.
pub const DEFAULT_CHECK_LEASE_JITTER_MS: u64 = 500;

/// Default time to wait for a message acknowledgement.
pub const DEFAULT_MESSAGE_ACK_TIMEOUT_MS: u64 = 1000;

/// Default number of retries after the first delivery attempt.
pub const DEFAULT_MESSAGE_RETRIES: u32 = 5;

/// Default first retry backoff in milliseconds.
pub const DEFAULT_RETRY_MIN_BACKOFF_MS: u64 = 1000;

/// Default backoff ceiling in milliseconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 30_000;

/// Action round trips wait this many ack timeouts for a response.
pub const ACTION_RESPONSE_TIMEOUT_FACTOR: u32 = 10;

/// Default fetch response timeout in milliseconds.
pub const DEFAULT_FETCH_RESPONSE_TIMEOUT_MS: u64 = 30_000;

/// Timing parameters of leases, heartbeats and delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorPeerConfig {
    /// Lease TTL.
    pub lease_duration: Duration,
    /// Leader renews this long before the lease expires.
    pub renew_lease_grace: Duration,
    /// Base interval between follower lease checks.
    pub check_lease_interval: Duration,
    /// Random delay in `[0, jitter]` added to each follower check.
    pub check_lease_jitter: Duration,
    /// Per-attempt acknowledgement timeout.
    pub message_ack_timeout: Duration,
    /// Retries after the first attempt.
    pub message_retries: u32,
    /// Backoff before the first retry; doubles per retry.
    pub retry_min_backoff: Duration,
    /// Backoff ceiling.
    pub retry_max_backoff: Duration,
    /// Time an action may take end to end, including delivery retries.
    pub action_response_timeout: Duration,
    /// Time a fetch may take end to end, including delivery retries.
    pub fetch_response_timeout: Duration,
}

impl ActorPeerConfig {
    /// Interval between leader lease renewals.
    pub fn renew_interval(&self) -> Duration {
        self.lease_duration.saturating_sub(self.renew_lease_grace)
    }

    /// Check the invariants the heartbeat relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renew_lease_grace >= self.lease_duration {
            return Err(ConfigError::InvalidValue(format!(
                "renew lease grace ({}ms) must be shorter than lease duration ({}ms)",
                self.renew_lease_grace.as_millis(),
                self.lease_duration.as_millis()
            )));
        }
        if self.check_lease_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "check lease interval must be positive".to_string(),
            ));
        }
        if self.retry_min_backoff > self.retry_max_backoff {
            return Err(ConfigError::InvalidValue(
                "retry min backoff exceeds retry max backoff".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ActorPeerConfig {
    fn default() -> Self {
        let message_ack_timeout = Duration::from_millis(DEFAULT_MESSAGE_ACK_TIMEOUT_MS);
        Self {
            lease_duration: Duration::from_millis(DEFAULT_LEASE_DURATION_MS),
            renew_lease_grace: Duration::from_millis(DEFAULT_RENEW_LEASE_GRACE_MS),
            check_lease_interval: Duration::from_millis(DEFAULT_CHECK_LEASE_INTERVAL_MS),
            check_lease_jitter: Duration::from_millis(DEFAULT_CHECK_LEASE_JITTER_MS),
            message_ack_timeout,
            message_retries: DEFAULT_MESSAGE_RETRIES,
            retry_min_backoff: Duration::from_millis(DEFAULT_RETRY_MIN_BACKOFF_MS),
            retry_max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
            action_response_timeout: message_ack_timeout * ACTION_RESPONSE_TIMEOUT_FACTOR,
            fetch_response_timeout: Duration::from_millis(DEFAULT_FETCH_RESPONSE_TIMEOUT_MS),
        }
    }
}

/// Process configuration for a Redis-backed node.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL.
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Prefix for every Redis key and channel (default: "coordinate").
    pub key_prefix: String,

    /// Lease, heartbeat and delivery timing.
    pub actor_peer: ActorPeerConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("key_prefix", &self.key_prefix)
            .field("actor_peer", &self.actor_peer)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let key_prefix = vars
            .get("COORDINATE_KEY_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

        let message_ack_timeout = parse_millis(
            vars,
            "COORDINATE_MESSAGE_ACK_TIMEOUT_MS",
            DEFAULT_MESSAGE_ACK_TIMEOUT_MS,
        )?;

        let action_response_timeout = match vars.get("COORDINATE_ACTION_RESPONSE_TIMEOUT_MS") {
            Some(_) => parse_millis(vars, "COORDINATE_ACTION_RESPONSE_TIMEOUT_MS", 0)?,
            None => message_ack_timeout * ACTION_RESPONSE_TIMEOUT_FACTOR,
        };

        let message_retries = match vars.get("COORDINATE_MESSAGE_RETRIES") {
            Some(raw) => raw.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("COORDINATE_MESSAGE_RETRIES={raw}: {e}"))
            })?,
            None => DEFAULT_MESSAGE_RETRIES,
        };

        let actor_peer = ActorPeerConfig {
            lease_duration: parse_millis(
                vars,
                "COORDINATE_LEASE_DURATION_MS",
                DEFAULT_LEASE_DURATION_MS,
            )?,
            renew_lease_grace: parse_millis(
                vars,
                "COORDINATE_RENEW_LEASE_GRACE_MS",
                DEFAULT_RENEW_LEASE_GRACE_MS,
            )?,
            check_lease_interval: parse_millis(
                vars,
                "COORDINATE_CHECK_LEASE_INTERVAL_MS",
                DEFAULT_CHECK_LEASE_INTERVAL_MS,
            )?,
            check_lease_jitter: parse_millis(
                vars,
                "COORDINATE_CHECK_LEASE_JITTER_MS",
                DEFAULT_CHECK_LEASE_JITTER_MS,
            )?,
            message_ack_timeout,
            message_retries,
            retry_min_backoff: parse_millis(
                vars,
                "COORDINATE_RETRY_MIN_BACKOFF_MS",
                DEFAULT_RETRY_MIN_BACKOFF_MS,
            )?,
            retry_max_backoff: parse_millis(
                vars,
                "COORDINATE_RETRY_MAX_BACKOFF_MS",
                DEFAULT_RETRY_MAX_BACKOFF_MS,
            )?,
            action_response_timeout,
            fetch_response_timeout: parse_millis(
                vars,
                "COORDINATE_FETCH_RESPONSE_TIMEOUT_MS",
                DEFAULT_FETCH_RESPONSE_TIMEOUT_MS,
            )?,
        };
        actor_peer.validate()?;

        Ok(Config {
            redis_url,
            key_prefix,
            actor_peer,
        })
    }
}

fn parse_millis(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidValue(format!("{name}={raw}: {e}"))),
        None => Ok(Duration::from_millis(default_ms)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "REDIS_URL".to_string(),
            "redis://:s3cret@localhost:6379".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(
            config.redis_url.expose_secret(),
            "redis://:s3cret@localhost:6379"
        );
        assert_eq!(config.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.actor_peer, ActorPeerConfig::default());
        assert_eq!(config.actor_peer.lease_duration, Duration::from_secs(3));
        assert_eq!(config.actor_peer.renew_interval(), Duration::from_millis(1500));
        assert_eq!(
            config.actor_peer.action_response_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(config.actor_peer.message_retries, 5);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("COORDINATE_KEY_PREFIX".to_string(), "game".to_string());
        vars.insert("COORDINATE_LEASE_DURATION_MS".to_string(), "5000".to_string());
        vars.insert("COORDINATE_RENEW_LEASE_GRACE_MS".to_string(), "2000".to_string());
        vars.insert("COORDINATE_CHECK_LEASE_INTERVAL_MS".to_string(), "250".to_string());
        vars.insert("COORDINATE_CHECK_LEASE_JITTER_MS".to_string(), "0".to_string());
        vars.insert("COORDINATE_MESSAGE_ACK_TIMEOUT_MS".to_string(), "200".to_string());
        vars.insert("COORDINATE_MESSAGE_RETRIES".to_string(), "2".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.key_prefix, "game");
        assert_eq!(config.actor_peer.lease_duration, Duration::from_secs(5));
        assert_eq!(config.actor_peer.renew_interval(), Duration::from_secs(3));
        assert_eq!(config.actor_peer.check_lease_interval, Duration::from_millis(250));
        assert!(config.actor_peer.check_lease_jitter.is_zero());
        assert_eq!(config.actor_peer.message_retries, 2);
        // Action timeout follows the ack timeout unless set explicitly
        assert_eq!(
            config.actor_peer.action_response_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_explicit_action_timeout_wins() {
        let mut vars = base_vars();
        vars.insert("COORDINATE_MESSAGE_ACK_TIMEOUT_MS".to_string(), "200".to_string());
        vars.insert(
            "COORDINATE_ACTION_RESPONSE_TIMEOUT_MS".to_string(),
            "7500".to_string(),
        );

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(
            config.actor_peer.action_response_timeout,
            Duration::from_millis(7500)
        );
    }

    #[test]
    fn test_from_vars_missing_redis_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_from_vars_rejects_malformed_number() {
        let mut vars = base_vars();
        vars.insert("COORDINATE_LEASE_DURATION_MS".to_string(), "3s".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("COORDINATE_LEASE_DURATION_MS"))
        );
    }

    #[test]
    fn test_from_vars_rejects_grace_longer_than_lease() {
        let mut vars = base_vars();
        vars.insert("COORDINATE_LEASE_DURATION_MS".to_string(), "1000".to_string());
        vars.insert("COORDINATE_RENEW_LEASE_GRACE_MS".to_string(), "1000".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("redis://"));
        assert!(!debug_output.contains("s3cret"));
    }
}
