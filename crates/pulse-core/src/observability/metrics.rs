//! Metric definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `pulse_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
///
/// Must be called from within a tokio runtime, before any metric is
/// recorded.
///
/// # Errors
///
/// Returns error if the recorder is already installed or the listener
/// cannot be started.
pub fn init_metrics_recorder(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        // Drift is a fraction of one check tick (50ms by default).
        .set_buckets_for_metric(
            Matcher::Full("pulse_beat_drift_seconds".to_string()),
            &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500],
        )
        .map_err(|e| format!("Failed to set beat drift buckets: {e}"))?
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Scheduler
// ============================================================================

/// Record a fired pulse.
///
/// Metric: `pulse_beats_total`
/// Labels: `phase` (primary, secondary)
pub fn record_beat(phase: &'static str) {
    counter!("pulse_beats_total", "phase" => phase).increment(1);
}

/// Record a beat suppressed by the double-fire guards.
///
/// Metric: `pulse_beats_skipped_total`
/// Labels: `reason` (latched, refractory)
pub fn record_beat_skipped(reason: &'static str) {
    counter!("pulse_beats_skipped_total", "reason" => reason).increment(1);
}

/// Record how late a beat fired relative to its anchor.
///
/// Metric: `pulse_beat_drift_seconds`
pub fn record_beat_drift(drift: Duration) {
    histogram!("pulse_beat_drift_seconds").record(drift.as_secs_f64());
}

/// Set the scheduler state gauge (0 idle, 1 running, 2 paused).
///
/// Metric: `pulse_scheduler_state`
pub fn set_scheduler_state(value: u8) {
    gauge!("pulse_scheduler_state").set(f64::from(value));
}

// ============================================================================
// Liveness
// ============================================================================

/// Record an emitted peer state change.
///
/// Metric: `pulse_peer_state_transitions_total`
/// Labels: `state` (active, background, terminated), `cause` (poll, timeout)
pub fn record_peer_transition(state: &'static str, cause: &'static str) {
    counter!(
        "pulse_peer_state_transitions_total",
        "state" => state,
        "cause" => cause
    )
    .increment(1);
}

// ============================================================================
// Sessions
// ============================================================================

/// Record a viewer-count transaction outcome.
///
/// Metric: `pulse_viewer_transactions_total`
/// Labels: `operation` (join, leave), `status` (success, error, absent)
pub fn record_viewer_transaction(operation: &'static str, status: &'static str) {
    counter!(
        "pulse_viewer_transactions_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

// ============================================================================
// Store and mode
// ============================================================================

/// Record a store failure that was logged and absorbed.
///
/// Metric: `pulse_store_errors_total`
/// Labels: `operation` (bounded by call site)
pub fn record_store_error(operation: &'static str) {
    counter!("pulse_store_errors_total", "operation" => operation).increment(1);
}

/// Record a distinct resolved mode.
///
/// Metric: `pulse_mode_changes_total`
/// Labels: `mode` (solo, paired, group_host, group_viewer)
pub fn record_mode_change(mode: &'static str) {
    counter!("pulse_mode_changes_total", "mode" => mode).increment(1);
}
