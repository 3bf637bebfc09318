//! Prometheus metrics for the queue server.
//!
//! Provides metrics collection and a Prometheus-compatible `/metrics` endpoint.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// Metric names as constants for consistency
const WS_CONNECTIONS_ACTIVE: &str = "queue_ws_connections_active";
const WS_MESSAGES_TOTAL: &str = "queue_ws_messages_total";
const SESSIONS_ACTIVE: &str = "queue_sessions_active";
const DELTAS_APPLIED_TOTAL: &str = "queue_deltas_applied_total";
const VERSION_CONFLICTS_TOTAL: &str = "queue_version_conflicts_total";
const RETRIES_EXHAUSTED_TOTAL: &str = "queue_retries_exhausted_total";
const CLIMB_FETCHES_TOTAL: &str = "queue_climb_fetches_total";
const VALIDATION_FAILURES_TOTAL: &str = "queue_validation_failures_total";
const RATE_LIMITED_TOTAL: &str = "queue_rate_limited_total";

/// Initialize metrics and return the Prometheus handle.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed
/// (e.g., if another recorder is already installed).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Increment active WebSocket connections.
pub fn inc_ws_connections() {
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement active WebSocket connections.
pub fn dec_ws_connections() {
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a WebSocket message.
///
/// # Arguments
///
/// * `direction` - "inbound" or "outbound"
/// * `msg_type` - Frame type (e.g., "join_session", "queue_delta", "ack")
pub fn record_ws_message(direction: &str, msg_type: &str) {
    counter!(
        WS_MESSAGES_TOTAL,
        "direction" => direction.to_string(),
        "type" => msg_type.to_string()
    )
    .increment(1);
}

/// Update the number of live sessions.
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions_active(count: usize) {
    gauge!(SESSIONS_ACTIVE).set(count as f64);
}

/// Record a delta committed by a room.
pub fn record_delta_applied(kind: &str) {
    counter!(DELTAS_APPLIED_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record an optimistic-concurrency conflict.
pub fn record_version_conflict() {
    counter!(VERSION_CONFLICTS_TOTAL).increment(1);
}

/// Record a mutation abandoned after the retry budget.
pub fn record_retries_exhausted() {
    counter!(RETRIES_EXHAUSTED_TOTAL).increment(1);
}

/// Record a climb-data fetch.
///
/// # Arguments
///
/// * `outcome` - "success", "failure" or "timeout"
pub fn record_climb_fetch(outcome: &str) {
    counter!(CLIMB_FETCHES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record an input validation failure.
///
/// # Arguments
///
/// * `validation_type` - Type of validation that failed (session_id, username, angle, etc.)
pub fn record_validation_failure(validation_type: &str) {
    counter!(
        VALIDATION_FAILURES_TOTAL,
        "type" => validation_type.to_string()
    )
    .increment(1);
}

/// Record a rate-limited frame.
pub fn record_rate_limited(source: &str) {
    counter!(
        RATE_LIMITED_TOTAL,
        "source" => source.to_string()
    )
    .increment(1);
}
