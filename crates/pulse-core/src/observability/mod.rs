//! Observability for Pulse Link.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `pulse_beats_total` | Counter | `phase` | Beat and secondary pulses fired |
//! | `pulse_beats_skipped_total` | Counter | `reason` | Beats suppressed by the latch or refractory guard |
//! | `pulse_beat_drift_seconds` | Histogram | none | Lateness of a beat relative to its anchor |
//! | `pulse_scheduler_state` | Gauge | none | 0 idle, 1 running, 2 paused |
//! | `pulse_peer_state_transitions_total` | Counter | `state`, `cause` | Liveness emissions |
//! | `pulse_viewer_transactions_total` | Counter | `operation`, `status` | Viewer join/leave transactions |
//! | `pulse_store_errors_total` | Counter | `operation` | Swallowed store failures |
//! | `pulse_mode_changes_total` | Counter | `mode` | Distinct resolved modes |
//!
//! Labels are bounded enums; identifiers never become label values.

pub mod metrics;
