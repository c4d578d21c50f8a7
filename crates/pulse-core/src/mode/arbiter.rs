//! Mode arbiter.
//!
//! [`resolve_mode`] is a pure function of its inputs. [`ModeArbiter`] wraps
//! it with change detection so dependents see one notification per distinct
//! resulting mode.

use crate::models::{Mode, ModeKind, PeerState, RemoteMode};
use crate::observability::metrics;
use crate::pulse::RateSource;
use common::types::UserId;
use tokio::sync::broadcast;
use tracing::info;

const MODE_CHANNEL_CAPACITY: usize = 16;

/// Broadcast state relevant to mode resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastFlags {
    /// This user's own session is broadcasting.
    pub own_broadcasting: bool,
    /// The session this user wants to watch is broadcasting.
    pub target_broadcasting: bool,
}

/// Everything mode resolution depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInputs {
    /// Role this device was configured with. Stands in for the announced
    /// mode until the remote mode document has been read.
    pub local_role: ModeKind,
    /// Authoritative announced mode, `None` while unknown.
    pub remote_mode: Option<RemoteMode>,
    pub selected_partner: Option<UserId>,
    /// Host of the watched session, once known.
    pub target_host: Option<UserId>,
    pub flags: BroadcastFlags,
}

impl ModeInputs {
    #[must_use]
    pub fn new(local_role: ModeKind) -> Self {
        Self {
            local_role,
            remote_mode: None,
            selected_partner: None,
            target_host: None,
            flags: BroadcastFlags::default(),
        }
    }
}

/// Resolve the current mode.
///
/// 1. announced host and own session broadcasting: `GroupHost`
/// 2. announced viewer and watched session broadcasting: `GroupViewer`
/// 3. announced paired with a partner selected: `Paired`
/// 4. otherwise `Solo`
#[must_use]
pub fn resolve_mode(inputs: &ModeInputs) -> Mode {
    let announced = inputs
        .remote_mode
        .as_ref()
        .map_or(inputs.local_role, RemoteMode::kind);

    match announced {
        ModeKind::GroupHost if inputs.flags.own_broadcasting => Mode::GroupHost,
        ModeKind::GroupViewer if inputs.flags.target_broadcasting => {
            match &inputs.target_host {
                Some(host_id) => Mode::GroupViewer {
                    host_id: host_id.clone(),
                },
                None => Mode::Solo,
            }
        }
        ModeKind::Paired => match &inputs.selected_partner {
            Some(partner_id) => Mode::Paired {
                partner_id: partner_id.clone(),
            },
            None => Mode::Solo,
        },
        ModeKind::Solo | ModeKind::GroupHost | ModeKind::GroupViewer => Mode::Solo,
    }
}

/// Rate source the scheduler should follow in `mode`, or `None` when no
/// pulse should play.
///
/// Paired mode requires the partner to be reachable (active or
/// background); `partner_state` is ignored in other modes.
#[must_use]
pub fn pulse_requirement(mode: &Mode, partner_state: Option<PeerState>) -> Option<RateSource> {
    match mode {
        Mode::Solo | Mode::GroupHost => Some(RateSource::LocalSensor),
        Mode::Paired { partner_id } => partner_state
            .filter(PeerState::is_reachable)
            .map(|_| RateSource::Remote(partner_id.clone())),
        Mode::GroupViewer { host_id } => Some(RateSource::Remote(host_id.clone())),
    }
}

/// Tracks the resolved mode and notifies on change.
pub struct ModeArbiter {
    current: Option<Mode>,
    events: broadcast::Sender<Mode>,
}

impl Default for ModeArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeArbiter {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(MODE_CHANNEL_CAPACITY);
        Self {
            current: None,
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Mode> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> Option<&Mode> {
        self.current.as_ref()
    }

    /// Re-resolve. Returns the new mode if it differs from the previous one.
    pub fn update(&mut self, inputs: &ModeInputs) -> Option<Mode> {
        let mode = resolve_mode(inputs);
        if self.current.as_ref() == Some(&mode) {
            return None;
        }

        info!(
            target: "pulse.mode",
            from = ?self.current.as_ref().map(ToString::to_string),
            to = %mode,
            "Mode changed"
        );
        metrics::record_mode_change(mode.kind().as_str());
        self.current = Some(mode.clone());
        // No subscribers is fine
        let _ = self.events.send(mode.clone());
        Some(mode)
    }
}
