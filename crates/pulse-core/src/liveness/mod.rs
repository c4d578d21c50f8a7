//! Peer liveness.
//!
//! Peers never hold a connection to each other. Each peer writes its own
//! `PeerStatus` with a heartbeat timestamp ([`PeerStatusReporter`]), and
//! observers infer liveness by polling that document plus a heartbeat
//! timeout ([`LivenessMonitor`]).
//!
//! "Terminated" covers both a closed app and an unreachable one.

pub mod monitor;
pub mod reporter;

pub use monitor::{ChangeCause, LivenessConfig, LivenessMonitor, PeerStateChange};
pub use reporter::PeerStatusReporter;
