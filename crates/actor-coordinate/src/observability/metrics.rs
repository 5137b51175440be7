//! Metric definitions for the coordination layer.
//!
//! All metrics follow Prometheus naming conventions:
//! - `coordinate_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `tag`: node message tags (16 values)
//! - `reason`: promotion and drop reasons (fewer than 5 values each)
//!
//! Actor ids and connection ids are never used as labels.
//!
//! No exporter is installed here. The embedding service installs whichever
//! recorder it uses; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Registry Gauges
// ============================================================================

/// Set the number of actor peers held by this node.
///
/// Metric: `coordinate_actor_peers_active`
pub fn set_actor_peers_active(count: usize) {
    // usize to f64 conversion is safe for realistic peer counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("coordinate_actor_peers_active").set(count as f64);
}

/// Set the number of relay connections terminated on this node.
///
/// Metric: `coordinate_relay_conns_active`
pub fn set_relay_conns_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("coordinate_relay_conns_active").set(count as f64);
}

// ============================================================================
// Leadership Counters
// ============================================================================

/// Record this node becoming leader of an actor.
///
/// Metric: `coordinate_leader_promotions_total`
/// Labels: `reason` (start, takeover)
pub fn record_leader_promotion(reason: &'static str) {
    counter!("coordinate_leader_promotions_total", "reason" => reason).increment(1);
}

/// Record a failed lease renewal that forced disposal.
///
/// Metric: `coordinate_leases_lost_total`
///
/// Non-zero values mean a leader stalled past its lease or the backend
/// was unreachable for longer than the renewal grace.
pub fn record_lease_lost() {
    counter!("coordinate_leases_lost_total").increment(1);
}

// ============================================================================
// Publisher Metrics
// ============================================================================

/// Record one publish attempt to a leader.
///
/// Metric: `coordinate_publish_attempts_total`
/// Labels: `tag`
pub fn record_publish_attempt(tag: &'static str) {
    counter!("coordinate_publish_attempts_total", "tag" => tag).increment(1);
}

/// Record a retryable publish failure that will be retried.
///
/// Metric: `coordinate_publish_retries_total`
/// Labels: `tag`
pub fn record_publish_retry(tag: &'static str) {
    counter!("coordinate_publish_retries_total", "tag" => tag).increment(1);
}

/// Record a publish that gave up after every attempt failed.
///
/// Metric: `coordinate_publish_exhausted_total`
/// Labels: `tag`
pub fn record_publish_exhausted(tag: &'static str) {
    counter!("coordinate_publish_exhausted_total", "tag" => tag).increment(1);
}

/// Record time from publish to acknowledgement.
///
/// Metric: `coordinate_ack_latency_seconds`
pub fn record_ack_latency(duration: Duration) {
    histogram!("coordinate_ack_latency_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Dispatcher Counters
// ============================================================================

/// Record an inbound node message.
///
/// Metric: `coordinate_messages_received_total`
/// Labels: `tag`
pub fn record_message_received(tag: &'static str) {
    counter!("coordinate_messages_received_total", "tag" => tag).increment(1);
}

/// Record an inbound message that was dropped.
///
/// Metric: `coordinate_messages_dropped_total`
/// Labels: `reason` (decode, protocol, no_target)
pub fn record_message_dropped(reason: &'static str) {
    counter!("coordinate_messages_dropped_total", "reason" => reason).increment(1);
}

/// Record a connection message rejected for a bad token.
///
/// Metric: `coordinate_conn_token_rejected_total`
pub fn record_conn_token_rejected() {
    counter!("coordinate_conn_token_rejected_total").increment(1);
}
