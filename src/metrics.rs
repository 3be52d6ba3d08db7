//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change capture and encoding
//! - Outbound queue pressure
//! - Peer connection and delivery
//! - Remote apply outcomes
//! - Engine lifecycle state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `graph_replication_` and follow
//! Prometheus conventions: counters end in `_total`, gauges represent
//! current state, histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record change events captured from a committed local transaction.
pub fn record_events_captured(count: usize) {
    counter!("graph_replication_events_captured_total").increment(count as u64);
}

/// Record a whole change set suppressed because its transaction was
/// remote-origin.
pub fn record_change_set_suppressed(events: usize) {
    counter!("graph_replication_change_sets_suppressed_total").increment(1);
    counter!("graph_replication_events_suppressed_total").increment(events as u64);
}

/// Record an event dropped at encode time for lack of a stable identifier.
pub fn record_missing_identifier() {
    counter!("graph_replication_missing_identifier_total").increment(1);
}

/// Record an operation enqueued for dispatch.
pub fn record_operation_enqueued(op_name: &'static str) {
    counter!("graph_replication_operations_enqueued_total", "op" => op_name).increment(1);
}

/// Record an event dropped because the outbound queue was full.
pub fn record_backpressure_drop() {
    counter!("graph_replication_backpressure_drops_total").increment(1);
}

/// Record a peer connection attempt.
pub fn record_peer_connection(peer_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("graph_replication_peer_connections_total", "peer_id" => peer_id.to_string(), "status" => status).increment(1);
}

/// Record an operation delivered to the peer.
pub fn record_operation_dispatched(peer_id: &str, op_name: &'static str) {
    counter!("graph_replication_operations_dispatched_total", "peer_id" => peer_id.to_string(), "op" => op_name).increment(1);
}

/// Record delivery latency for one operation (including retries).
pub fn record_dispatch_latency(peer_id: &str, duration: Duration) {
    histogram!("graph_replication_dispatch_duration_seconds", "peer_id" => peer_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record an operation whose retry budget was exhausted.
pub fn record_delivery_failure(peer_id: &str) {
    counter!("graph_replication_delivery_failures_total", "peer_id" => peer_id.to_string())
        .increment(1);
}

/// Record a remote operation applied to the local graph.
pub fn record_operation_applied(source: &str, op_name: &'static str) {
    counter!("graph_replication_operations_applied_total", "source" => source.to_string(), "op" => op_name).increment(1);
}

/// Record a remote delete that matched nothing locally.
pub fn record_noop_apply(source: &str) {
    counter!("graph_replication_noop_applies_total", "source" => source.to_string()).increment(1);
}

/// Record an inbound connection rejected during the handshake.
pub fn record_handshake_rejected() {
    counter!("graph_replication_handshake_rejected_total").increment(1);
}

/// Record the engine lifecycle state as a numeric gauge.
///
/// 0=idle, 1=connecting, 2=running, 3=stopping, 4=stopped, 5=failed.
pub fn set_engine_state(state: u8) {
    gauge!("graph_replication_engine_state").set(state as f64);
}

/// Record the current outbound queue depth.
pub fn set_queue_depth(depth: usize) {
    gauge!("graph_replication_queue_depth").set(depth as f64);
}
