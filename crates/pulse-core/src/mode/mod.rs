//! Mode resolution.
//!
//! Reduces the locally configured role and the remote announcements into a
//! single [`Mode`](crate::models::Mode), and derives from it which rate
//! source (if any) drives the pulse.

pub mod arbiter;

pub use arbiter::{pulse_requirement, resolve_mode, BroadcastFlags, ModeArbiter, ModeInputs};
