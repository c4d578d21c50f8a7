//! Liveness monitor for a single remote peer.
//!
//! Two independent loops share one state cell:
//!
//! - **poll**: every `poll_interval`, fetch `peer:{id}:status` and emit when
//!   the inferred state differs from the last known one.
//! - **timeout**: every `poll_interval`, force `Terminated` once no heartbeat
//!   has been seen for `heartbeat_timeout`.
//!
//! # Fencing
//!
//! Each `start_monitoring` call bumps a generation counter. Loops capture the
//! generation they were started with and re-check it under the lock after
//! every await, so a fetch that completes after `stop_monitoring` (or after a
//! restart for another peer) never mutates state or emits.
//!
//! # Stale claims
//!
//! After a timeout the peer's last document usually still says
//! `is_active: true`. That claim is ignored until the document changes;
//! otherwise a dead peer would flap between active and terminated once per
//! timeout window.

use crate::models::{local_instant, PeerState, PeerStatus};
use crate::observability::metrics;
use crate::store::{SharedStore, StorePath};
use chrono::{DateTime, Utc};
use common::types::PeerId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default heartbeat timeout.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Timing for one monitoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub poll_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// What produced a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Poll,
    Timeout,
}

impl ChangeCause {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChangeCause::Poll => "poll",
            ChangeCause::Timeout => "timeout",
        }
    }
}

/// Emitted once per actual state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStateChange {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub cause: ChangeCause,
}

#[derive(Debug)]
struct MonitorShared {
    generation: u64,
    peer_id: Option<PeerId>,
    state: Option<PeerState>,
    last_heartbeat_at: Instant,
    /// Newest remote heartbeat timestamp seen so far.
    last_remote_heartbeat: Option<DateTime<Utc>>,
    last_seen: Option<PeerStatus>,
    /// Document observed when the timeout fired.
    timed_out_on: Option<PeerStatus>,
}

impl MonitorShared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.peer_id.is_some()
    }

    /// Apply a polled status. Returns the new state when it changed.
    fn apply_poll(&mut self, status: &PeerStatus) -> Option<PeerState> {
        if self.timed_out_on.as_ref() == Some(status) {
            return None;
        }
        self.timed_out_on = None;
        self.last_seen = Some(status.clone());

        // A newer remote heartbeat is evidence the peer is alive right now.
        let fresh = match (status.last_heartbeat_at, self.last_remote_heartbeat) {
            (Some(remote), Some(seen)) => remote > seen,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if fresh {
            self.last_remote_heartbeat = status.last_heartbeat_at;
            self.last_heartbeat_at = local_instant(status.last_heartbeat_at);
        }

        let inferred = status.inferred_state();
        if self.state == Some(inferred) {
            return None;
        }

        if inferred == PeerState::Active {
            self.last_heartbeat_at = local_instant(status.last_heartbeat_at);
        }
        self.state = Some(inferred);
        Some(inferred)
    }
}

/// Monitors one remote peer at a time.
///
/// Dropping the monitor stops its loops.
pub struct LivenessMonitor {
    store: SharedStore,
    shared: Arc<Mutex<MonitorShared>>,
    cancel_token: Option<CancellationToken>,
    events: broadcast::Sender<PeerStateChange>,
}

impl LivenessMonitor {
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            shared: Arc::new(Mutex::new(MonitorShared {
                generation: 0,
                peer_id: None,
                state: None,
                last_heartbeat_at: Instant::now(),
                last_remote_heartbeat: None,
                last_seen: None,
                timed_out_on: None,
            })),
            cancel_token: None,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorShared> {
        lock_shared(&self.shared)
    }

    /// Start monitoring `peer_id`, replacing any previous run.
    ///
    /// Returns a receiver of state changes. More receivers can be obtained
    /// with [`LivenessMonitor::subscribe`].
    #[instrument(skip_all, fields(peer_id = %peer_id))]
    pub fn start_monitoring(
        &mut self,
        peer_id: PeerId,
        config: LivenessConfig,
    ) -> broadcast::Receiver<PeerStateChange> {
        self.stop_monitoring();

        let receiver = self.events.subscribe();
        let generation = {
            let mut shared = self.lock();
            shared.generation += 1;
            shared.peer_id = Some(peer_id.clone());
            shared.state = None;
            shared.last_heartbeat_at = Instant::now();
            shared.last_remote_heartbeat = None;
            shared.last_seen = None;
            shared.timed_out_on = None;
            shared.generation
        };

        let cancel_token = CancellationToken::new();
        self.cancel_token = Some(cancel_token.clone());

        info!(
            target: "pulse.liveness",
            peer_id = %peer_id,
            poll_interval_s = config.poll_interval.as_secs_f64(),
            heartbeat_timeout_s = config.heartbeat_timeout.as_secs_f64(),
            generation = generation,
            "Liveness monitoring started"
        );

        tokio::spawn(poll_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            self.events.clone(),
            peer_id.clone(),
            generation,
            config.poll_interval,
            cancel_token.clone(),
        ));
        tokio::spawn(timeout_loop(
            Arc::clone(&self.shared),
            self.events.clone(),
            peer_id,
            generation,
            config,
            cancel_token,
        ));

        receiver
    }

    /// Stop monitoring. Safe to call when not monitoring.
    pub fn stop_monitoring(&mut self) {
        let Some(cancel_token) = self.cancel_token.take() else {
            return;
        };
        cancel_token.cancel();

        let mut shared = self.lock();
        shared.generation += 1;
        if let Some(peer_id) = shared.peer_id.take() {
            debug!(
                target: "pulse.liveness",
                peer_id = %peer_id,
                "Liveness monitoring stopped"
            );
        }
        shared.state = None;
        shared.last_remote_heartbeat = None;
        shared.last_seen = None;
        shared.timed_out_on = None;
    }

    /// Additional receiver for state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PeerStateChange> {
        self.events.subscribe()
    }

    /// Peer currently monitored.
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        self.lock().peer_id.clone()
    }

    /// Last known state of the monitored peer (`None` before the first poll).
    #[must_use]
    pub fn current_state(&self) -> Option<PeerState> {
        self.lock().state
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

fn lock_shared(shared: &Mutex<MonitorShared>) -> MutexGuard<'_, MonitorShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn emit(
    events: &broadcast::Sender<PeerStateChange>,
    peer_id: &PeerId,
    state: PeerState,
    cause: ChangeCause,
) {
    info!(
        target: "pulse.liveness",
        peer_id = %peer_id,
        state = %state,
        cause = cause.as_str(),
        "Peer state changed"
    );
    metrics::record_peer_transition(state.as_str(), cause.as_str());
    // No receivers is fine
    let _ = events.send(PeerStateChange {
        peer_id: peer_id.clone(),
        state,
        cause,
    });
}

async fn poll_loop(
    store: SharedStore,
    shared: Arc<Mutex<MonitorShared>>,
    events: broadcast::Sender<PeerStateChange>,
    peer_id: PeerId,
    generation: u64,
    poll_interval: Duration,
    cancel_token: CancellationToken,
) {
    let path = StorePath::peer_status(&peer_id);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = store.get(&path).await;

        let mut cell = lock_shared(&shared);
        if !cell.is_current(generation) {
            debug!(
                target: "pulse.liveness",
                peer_id = %peer_id,
                "Dropping poll result from a previous monitoring run"
            );
            break;
        }

        match fetched {
            Ok(snapshot) => {
                // Missing or malformed document: no update
                let Some(status) = snapshot.decode::<PeerStatus>() else {
                    continue;
                };
                if let Some(new_state) = cell.apply_poll(&status) {
                    emit(&events, &peer_id, new_state, ChangeCause::Poll);
                }
            }
            Err(e) => {
                warn!(
                    target: "pulse.liveness",
                    peer_id = %peer_id,
                    error = %e,
                    "Peer status fetch failed, will retry"
                );
                metrics::record_store_error("peer_status_get");
            }
        }
    }
}

async fn timeout_loop(
    shared: Arc<Mutex<MonitorShared>>,
    events: broadcast::Sender<PeerStateChange>,
    peer_id: PeerId,
    generation: u64,
    config: LivenessConfig,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut cell = lock_shared(&shared);
        if !cell.is_current(generation) {
            break;
        }
        if cell.state == Some(PeerState::Terminated) {
            continue;
        }
        if cell.last_heartbeat_at.elapsed() < config.heartbeat_timeout {
            continue;
        }

        cell.state = Some(PeerState::Terminated);
        cell.last_heartbeat_at = Instant::now();
        cell.timed_out_on = cell.last_seen.clone();
        emit(&events, &peer_id, PeerState::Terminated, ChangeCause::Timeout);
    }
}
