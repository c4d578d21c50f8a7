//! Pulse Link core library
//!
//! Real-time heart-rate sharing between devices that only talk through a
//! shared key-path document store:
//!
//! - Peer liveness inference from status documents and heartbeats
//! - Broadcast sessions with public discovery and an atomic viewer count
//! - A drift-free pulse scheduler driven by a local or remote heart rate
//! - Mode resolution (solo, paired, group host, group viewer)
//!
//! # Architecture
//!
//! ```text
//! PulseNode (one per device)
//! ├── ModeArbiter          resolves the mode from the announced mode + flags
//! ├── LivenessMonitor      polls the partner/host status document
//! ├── SessionCoordinator   sessions, discovery records, viewer count
//! ├── PulseScheduler       actor emitting beats for the gated rate source
//! │   └── RateFollower     feeds a remote user's rate into the scheduler
//! └── PeerStatusReporter   heartbeats for this device
//! ```
//!
//! Every component talks to the store through [`store::RemoteStore`];
//! [`store::RedisStore`] is the production backend and
//! [`store::InMemoryStore`] the in-process one used by tests.
//!
//! # Modules
//!
//! - [`config`] - Node configuration from environment
//! - [`errors`] - Error types
//! - [`liveness`] - Peer liveness monitoring and status reporting
//! - [`mode`] - Mode resolution
//! - [`models`] - Store documents and the resolved mode
//! - [`node`] - Per-device wiring
//! - [`observability`] - Metrics
//! - [`pulse`] - Beat clock, scheduler, rate publishing
//! - [`session`] - Broadcast sessions and discovery
//! - [`store`] - Remote store abstraction and backends

pub mod config;
pub mod errors;
pub mod liveness;
pub mod mode;
pub mod models;
pub mod node;
pub mod observability;
pub mod pulse;
pub mod session;
pub mod store;
