//! Broadcast sessions ("rooms").
//!
//! A session is owned by its host. While broadcasting, a public
//! [`DiscoveryRecord`](crate::models::DiscoveryRecord) mirrors it and carries
//! the live viewer count. The session flag and the discovery record are two
//! separate writes, so they are only eventually consistent; see
//! [`SessionCoordinator::check_broadcast_consistency`].

pub mod coordinator;

pub use coordinator::{BroadcastConsistency, DiscoveryUpdate, DiscoveryWatch, SessionCoordinator};
