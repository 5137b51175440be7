//! Observability for the coordination layer.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Connection tokens and the Redis URL are never recorded.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `coordinate_actor_peers_active` | Gauge | none |
//! | `coordinate_relay_conns_active` | Gauge | none |
//! | `coordinate_leader_promotions_total` | Counter | `reason` |
//! | `coordinate_leases_lost_total` | Counter | none |
//! | `coordinate_publish_attempts_total` | Counter | `tag` |
//! | `coordinate_publish_retries_total` | Counter | `tag` |
//! | `coordinate_publish_exhausted_total` | Counter | `tag` |
//! | `coordinate_ack_latency_seconds` | Histogram | none |
//! | `coordinate_messages_received_total` | Counter | `tag` |
//! | `coordinate_messages_dropped_total` | Counter | `reason` |
//! | `coordinate_conn_token_rejected_total` | Counter | none |

pub mod metrics;
