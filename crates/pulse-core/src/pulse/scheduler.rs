//! `PulseScheduler` actor.
//!
//! Owns the [`BeatClock`] and turns rate updates plus the mode gate into a
//! stream of [`PulseEvent`]s.
//!
//! # States
//!
//! ```text
//! Idle ──(gate set, fresh rate > 0)──► Running ◄──(conditions hold again)── Paused
//!                                         │                                   ▲
//!                                         └──(gate cleared, rate stale/≤ 0)───┘
//! ```
//!
//! The gate names the only [`RateSource`] whose updates are accepted. It is
//! set by the mode layer: the local sensor in solo and host modes, the
//! partner or host in paired and viewer modes, nothing when no pulse should
//! play.

use super::clock::{BeatClock, ClockEvent};
use crate::errors::PulseError;
use crate::observability::metrics;
use common::types::UserId;
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default check tick.
pub const DEFAULT_CHECK_TICK: Duration = Duration::from_millis(50);

/// Default rate staleness threshold.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(300);

const SCHEDULER_CHANNEL_BUFFER: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where the driving rate comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateSource {
    LocalSensor,
    /// Last rate reported by another user (partner or host).
    Remote(UserId),
}

impl fmt::Display for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSource::LocalSensor => write!(f, "local"),
            RateSource::Remote(user_id) => write!(f, "remote({user_id})"),
        }
    }
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
}

impl SchedulerState {
    const fn gauge_value(self) -> u8 {
        match self {
            SchedulerState::Idle => 0,
            SchedulerState::Running => 1,
            SchedulerState::Paused => 2,
        }
    }
}

/// Snapshot of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Current rate while running or paused.
    pub bpm: Option<f64>,
    /// Current beat interval while running.
    pub interval: Option<Duration>,
    pub source: Option<RateSource>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            bpm: None,
            interval: None,
            source: None,
        }
    }
}

/// Emitted by a running scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum PulseEvent {
    /// Primary pulse.
    Beat {
        at: Instant,
        interval: Duration,
        bpm: f64,
    },
    /// Second phase of the pulse, a fraction of an interval after the beat.
    SecondaryPulse { at: Instant },
    /// The two-phase pulse finished.
    PulseComplete { at: Instant },
}

/// Scheduler timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub check_tick: Duration,
    pub staleness_threshold: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_tick: DEFAULT_CHECK_TICK,
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
        }
    }
}

/// Messages accepted by the scheduler actor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// A rate sample from `source`, observed at `observed_at`.
    Rate {
        bpm: f64,
        source: RateSource,
        observed_at: Instant,
    },
    /// Set or clear the accepted rate source.
    Gate { source: Option<RateSource> },
    GetStatus {
        respond_to: oneshot::Sender<SchedulerStatus>,
    },
}

/// Handle to the scheduler actor. Cheap to clone.
#[derive(Clone)]
pub struct PulseSchedulerHandle {
    sender: mpsc::Sender<SchedulerMessage>,
    events: broadcast::Sender<PulseEvent>,
    status: watch::Receiver<SchedulerStatus>,
    cancel_token: CancellationToken,
}

impl PulseSchedulerHandle {
    /// Spawn the scheduler actor and return a handle to it.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(SCHEDULER_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status) = watch::channel(SchedulerStatus::default());
        let cancel_token = CancellationToken::new();

        let actor = PulseScheduler {
            config,
            receiver,
            events: events.clone(),
            status: status_tx,
            cancel_token: cancel_token.clone(),
            gate: None,
            rate: None,
            clock: None,
            state: SchedulerState::Idle,
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            events,
            status,
            cancel_token,
        }
    }

    async fn send(&self, message: SchedulerMessage) -> Result<(), PulseError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| PulseError::Internal(format!("scheduler channel send failed: {e}")))
    }

    /// Feed a rate sample observed now.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor has stopped.
    pub async fn update_rate(&self, bpm: f64, source: RateSource) -> Result<(), PulseError> {
        self.update_rate_at(bpm, source, Instant::now()).await
    }

    /// Feed a rate sample observed at `observed_at`.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor has stopped.
    pub async fn update_rate_at(
        &self,
        bpm: f64,
        source: RateSource,
        observed_at: Instant,
    ) -> Result<(), PulseError> {
        self.send(SchedulerMessage::Rate {
            bpm,
            source,
            observed_at,
        })
        .await
    }

    /// Set the accepted rate source (`None`: no pulse required).
    ///
    /// # Errors
    ///
    /// `Internal` if the actor has stopped.
    pub async fn set_gate(&self, source: Option<RateSource>) -> Result<(), PulseError> {
        self.send(SchedulerMessage::Gate { source }).await
    }

    /// Query the actor for its status.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor has stopped.
    pub async fn get_status(&self) -> Result<SchedulerStatus, PulseError> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerMessage::GetStatus { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| PulseError::Internal(format!("response receive failed: {e}")))
    }

    /// Latest published status, without a round trip.
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Follow status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Receive pulse events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PulseEvent> {
        self.events.subscribe()
    }

    /// Stop the actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Scheduler actor state.
struct PulseScheduler {
    config: SchedulerConfig,
    receiver: mpsc::Receiver<SchedulerMessage>,
    events: broadcast::Sender<PulseEvent>,
    status: watch::Sender<SchedulerStatus>,
    cancel_token: CancellationToken,
    gate: Option<RateSource>,
    /// Latest accepted rate and when it was observed.
    rate: Option<(f64, Instant)>,
    clock: Option<BeatClock>,
    state: SchedulerState,
}

impl PulseScheduler {
    #[instrument(skip_all, name = "pulse.scheduler")]
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.check_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            target: "pulse.scheduler",
            check_tick_ms = self.config.check_tick.as_millis(),
            staleness_s = self.config.staleness_threshold.as_secs(),
            "Pulse scheduler started"
        );
        metrics::set_scheduler_state(self.state.gauge_value());

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.handle_message(message);
                }
                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
        }

        info!(target: "pulse.scheduler", "Pulse scheduler stopped");
    }

    fn handle_message(&mut self, message: SchedulerMessage) {
        let now = Instant::now();
        match message {
            SchedulerMessage::Rate {
                bpm,
                source,
                observed_at,
            } => {
                if self.gate.as_ref() != Some(&source) {
                    debug!(
                        target: "pulse.scheduler",
                        source = %source,
                        "Ignoring rate from a source that is not gated in"
                    );
                    return;
                }
                self.rate = Some((bpm, observed_at));
                self.evaluate(now);
            }
            SchedulerMessage::Gate { source } => {
                if self.gate == source {
                    return;
                }
                debug!(
                    target: "pulse.scheduler",
                    source = ?source.as_ref().map(ToString::to_string),
                    "Rate source gate changed"
                );
                // Rates from the previous source no longer apply.
                self.rate = None;
                self.gate = source;
                self.evaluate(now);
            }
            SchedulerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status.borrow().clone());
            }
        }
    }

    /// Fresh, positive rate for the gated source.
    fn usable_rate(&self, now: Instant) -> Option<f64> {
        self.gate.as_ref()?;
        let (bpm, observed_at) = self.rate?;
        if bpm.is_nan() || bpm <= 0.0 {
            return None;
        }
        if now.saturating_duration_since(observed_at) > self.config.staleness_threshold {
            return None;
        }
        Some(bpm)
    }

    /// Re-derive the state from the gate and the latest rate.
    fn evaluate(&mut self, now: Instant) {
        match (self.usable_rate(now), self.state) {
            (Some(bpm), SchedulerState::Running) => {
                if let Some(clock) = self.clock.as_mut() {
                    clock.set_rate(bpm);
                }
            }
            (Some(bpm), SchedulerState::Idle | SchedulerState::Paused) => {
                match self.clock.as_mut() {
                    Some(clock) => {
                        clock.set_rate(bpm);
                        clock.reset(now);
                    }
                    None => self.clock = Some(BeatClock::new(bpm, now)),
                }
                self.transition(SchedulerState::Running);
            }
            (None, SchedulerState::Running) => self.transition(SchedulerState::Paused),
            (None, SchedulerState::Idle | SchedulerState::Paused) => {}
        }
        self.publish_status();
    }

    fn transition(&mut self, next: SchedulerState) {
        info!(
            target: "pulse.scheduler",
            from = ?self.state,
            to = ?next,
            source = ?self.gate.as_ref().map(ToString::to_string),
            "Scheduler state changed"
        );
        self.state = next;
        metrics::set_scheduler_state(next.gauge_value());
    }

    fn publish_status(&self) {
        let status = SchedulerStatus {
            state: self.state,
            bpm: self.rate.map(|(bpm, _)| bpm).filter(|_| self.gate.is_some()),
            interval: match self.state {
                SchedulerState::Running => self.clock.as_ref().map(BeatClock::interval),
                SchedulerState::Idle | SchedulerState::Paused => None,
            },
            source: self.gate.clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn on_tick(&mut self, now: Instant) {
        if self.state != SchedulerState::Running {
            return;
        }
        if self.usable_rate(now).is_none() {
            info!(
                target: "pulse.scheduler",
                staleness_s = self.config.staleness_threshold.as_secs(),
                "Rate went stale, pausing"
            );
            self.transition(SchedulerState::Paused);
            self.publish_status();
            return;
        }
        let Some(clock) = self.clock.as_mut() else {
            return;
        };
        let interval = clock.interval();
        let bpm = self.rate.map_or(0.0, |(bpm, _)| bpm);

        for event in clock.on_tick(now) {
            let pulse = match event {
                ClockEvent::Beat { drift } => {
                    metrics::record_beat("primary");
                    metrics::record_beat_drift(drift);
                    PulseEvent::Beat {
                        at: now,
                        interval,
                        bpm,
                    }
                }
                ClockEvent::Secondary => {
                    metrics::record_beat("secondary");
                    PulseEvent::SecondaryPulse { at: now }
                }
                ClockEvent::SequenceComplete => PulseEvent::PulseComplete { at: now },
                ClockEvent::Skipped(reason) => {
                    debug!(
                        target: "pulse.scheduler",
                        reason = reason.as_str(),
                        "Beat skipped"
                    );
                    metrics::record_beat_skipped(reason.as_str());
                    continue;
                }
            };
            // No subscribers is fine
            let _ = self.events.send(pulse);
        }
    }
}
