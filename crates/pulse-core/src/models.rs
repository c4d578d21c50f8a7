//! Documents exchanged through the remote store, and the resolved `Mode`.
//!
//! All store documents are serialized as JSON with `snake_case` fields.
//! Timestamps are UTC wall-clock (`chrono`); in-process timing uses
//! `tokio::time::Instant` and never crosses the store.

use chrono::{DateTime, Utc};
use common::types::{PeerId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Why a peer reported its current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatusReason {
    /// App in the foreground.
    Foreground,
    /// App backgrounded but still running.
    Background,
    /// App closed.
    Terminated,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Liveness status a peer writes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub is_active: bool,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: PeerStatusReason,
}

impl PeerStatus {
    /// Infer the peer state this status describes.
    ///
    /// `is_active` wins; otherwise an explicit termination is terminated and
    /// anything else (background, unknown) is background.
    #[must_use]
    pub fn inferred_state(&self) -> PeerState {
        if self.is_active {
            PeerState::Active
        } else if self.reason == PeerStatusReason::Terminated {
            PeerState::Terminated
        } else {
            PeerState::Background
        }
    }
}

/// Inferred liveness of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Active,
    Background,
    /// Closed or unreachable; the two are not distinguished.
    Terminated,
}

impl PeerState {
    /// Label value for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PeerState::Active => "active",
            PeerState::Background => "background",
            PeerState::Terminated => "terminated",
        }
    }

    /// Whether the peer can still supply a rate (paired gating).
    #[must_use]
    pub const fn is_reachable(&self) -> bool {
        matches!(self, PeerState::Active | PeerState::Background)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast session ("room") owned by its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub host_id: UserId,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub member_ids: BTreeSet<UserId>,
    pub is_active: bool,
    pub is_broadcasting: bool,
    /// Reset by the host on start/stop. The live count is on the
    /// [`DiscoveryRecord`].
    #[serde(default)]
    pub viewer_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Public listing of a broadcasting session.
///
/// Exists only while the session is broadcasting. `viewer_count` is the
/// authoritative aggregate and is only changed through `transact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub session_id: SessionId,
    pub host_id: UserId,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub session_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub viewer_count: u32,
}

/// A viewer's presence in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerRegistration {
    pub session_id: SessionId,
    pub viewer_id: UserId,
    pub registered_at: DateTime<Utc>,
}

/// Mode a user announces in `user:{id}:mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RemoteMode {
    Solo,
    Paired,
    GroupHost { session_id: SessionId },
    GroupViewer { session_id: SessionId },
}

impl RemoteMode {
    #[must_use]
    pub fn kind(&self) -> ModeKind {
        match self {
            RemoteMode::Solo => ModeKind::Solo,
            RemoteMode::Paired => ModeKind::Paired,
            RemoteMode::GroupHost { .. } => ModeKind::GroupHost,
            RemoteMode::GroupViewer { .. } => ModeKind::GroupViewer,
        }
    }

    /// Session the mode refers to, for the group modes.
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            RemoteMode::GroupHost { session_id } | RemoteMode::GroupViewer { session_id } => {
                Some(session_id)
            }
            RemoteMode::Solo | RemoteMode::Paired => None,
        }
    }
}

/// Latest heart rate a user reported.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateRecord {
    pub bpm: f64,
    pub measured_at: DateTime<Utc>,
}

/// Mode kind without its parameters. Also used for the locally configured
/// role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Solo,
    Paired,
    GroupHost,
    GroupViewer,
}

impl ModeKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ModeKind::Solo => "solo",
            ModeKind::Paired => "paired",
            ModeKind::GroupHost => "group_host",
            ModeKind::GroupViewer => "group_viewer",
        }
    }
}

/// Resolved operating mode of this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    Solo,
    Paired { partner_id: UserId },
    GroupHost,
    GroupViewer { host_id: UserId },
}

impl Mode {
    #[must_use]
    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::Solo => ModeKind::Solo,
            Mode::Paired { .. } => ModeKind::Paired,
            Mode::GroupHost => ModeKind::GroupHost,
            Mode::GroupViewer { .. } => ModeKind::GroupViewer,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Solo => write!(f, "solo"),
            Mode::Paired { partner_id } => write!(f, "paired({partner_id})"),
            Mode::GroupHost => write!(f, "group_host"),
            Mode::GroupViewer { host_id } => write!(f, "group_viewer({host_id})"),
        }
    }
}

/// Map a wall-clock timestamp onto the monotonic clock by its age.
/// Missing or future timestamps map to "now".
pub(crate) fn local_instant(at: Option<DateTime<Utc>>) -> Instant {
    let now = Instant::now();
    let Some(at) = at else {
        return now;
    };
    let age = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
    now.checked_sub(age).unwrap_or(now)
}
