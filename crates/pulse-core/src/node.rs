//! `PulseNode` - one device's view of Pulse Link.
//!
//! The node actor owns every per-mode resource:
//!
//! - the subscription to this user's announced mode (`user:{id}:mode`)
//! - the hosted session document, or the watched discovery record
//! - liveness monitoring of the partner or host
//! - the remote rate follower
//!
//! After every input change it re-resolves the mode and reconciles the
//! scheduler gate and follower with it. Store failures never stop the
//! node; missing subscriptions are retried on the resubscribe tick.
//!
//! # Shutdown
//!
//! [`PulseNode::shutdown`] leaves a joined session, stops a running
//! broadcast, cancels every subscription and writes a final `terminated`
//! peer status.

use crate::config::{Config, RoleConfig};
use crate::errors::PulseError;
use crate::liveness::{LivenessConfig, LivenessMonitor, PeerStateChange, PeerStatusReporter};
use crate::mode::{pulse_requirement, ModeArbiter, ModeInputs};
use crate::models::{DiscoveryRecord, Mode, ModeKind, PeerState, PeerStatusReason, RemoteMode, Session};
use crate::observability::metrics;
use crate::pulse::{
    PulseEvent, PulseSchedulerHandle, RateFeed, RateFollower, RateSource, SchedulerConfig,
};
use crate::session::{DiscoveryUpdate, DiscoveryWatch, SessionCoordinator};
use crate::store::{SharedStore, Snapshot, StorePath, Subscription};
use common::types::{SessionId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const NODE_CHANNEL_BUFFER: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Interval at which failed or ended subscriptions are re-established.
pub const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(5);

/// Settings for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub user_id: UserId,
    pub display_name: String,
    /// Mode kind assumed until the announced mode has been read.
    pub local_role: ModeKind,
    pub liveness: LivenessConfig,
    pub heartbeat_interval: Duration,
    pub scheduler: SchedulerConfig,
}

impl NodeConfig {
    /// Defaults for `user_id` in solo mode.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            display_name: user_id.to_string(),
            user_id,
            local_role: ModeKind::Solo,
            liveness: LivenessConfig::default(),
            heartbeat_interval: crate::liveness::reporter::DEFAULT_HEARTBEAT_INTERVAL,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl From<&Config> for NodeConfig {
    fn from(config: &Config) -> Self {
        Self {
            user_id: config.user_id.clone(),
            display_name: config.display_name.clone(),
            local_role: config.role.kind(),
            liveness: LivenessConfig {
                poll_interval: config.poll_interval,
                heartbeat_timeout: config.heartbeat_timeout,
            },
            heartbeat_interval: config.heartbeat_interval,
            scheduler: SchedulerConfig {
                check_tick: config.check_tick,
                staleness_threshold: config.rate_staleness,
            },
        }
    }
}

/// Notification re-broadcast by the node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    ModeChanged(Mode),
    PeerStateChanged(PeerStateChange),
    Pulse(PulseEvent),
}

/// Requests handled by the node actor.
#[derive(Debug)]
enum NodeMessage {
    SelectPartner {
        partner_id: Option<UserId>,
        respond_to: oneshot::Sender<Result<(), PulseError>>,
    },
    StartBroadcast {
        session_name: String,
        respond_to: oneshot::Sender<Result<DiscoveryRecord, PulseError>>,
    },
    StopBroadcast {
        respond_to: oneshot::Sender<Result<(), PulseError>>,
    },
    JoinSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<u32, PulseError>>,
    },
    LeaveSession {
        respond_to: oneshot::Sender<Result<(), PulseError>>,
    },
}

/// Running node. Dropping it cancels the actor without the graceful
/// shutdown writes.
pub struct PulseNode {
    user_id: UserId,
    sender: mpsc::Sender<NodeMessage>,
    events: broadcast::Sender<NodeEvent>,
    mode: watch::Receiver<Option<Mode>>,
    scheduler: PulseSchedulerHandle,
    feed: RateFeed,
    reporter: Option<PeerStatusReporter>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PulseNode {
    /// Start the scheduler, status reporter and node actor.
    #[must_use]
    pub fn start(store: SharedStore, config: NodeConfig) -> Self {
        let (sender, receiver) = mpsc::channel(NODE_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (mode_tx, mode) = watch::channel(None);
        let cancel_token = CancellationToken::new();

        let scheduler = PulseSchedulerHandle::new(config.scheduler);
        let reporter = PeerStatusReporter::start(
            Arc::clone(&store),
            config.user_id.clone(),
            config.heartbeat_interval,
        );
        let feed = RateFeed::new(Arc::clone(&store), config.user_id.clone());

        let monitor = LivenessMonitor::new(Arc::clone(&store));
        let actor = NodeActor {
            coordinator: SessionCoordinator::new(Arc::clone(&store)),
            store,
            user_id: config.user_id.clone(),
            display_name: config.display_name,
            liveness: config.liveness,
            receiver,
            cancel_token: cancel_token.clone(),
            events: events.clone(),
            mode_tx,
            pulses: scheduler.subscribe(),
            scheduler: scheduler.clone(),
            inputs: ModeInputs::new(config.local_role),
            arbiter: ModeArbiter::new(),
            peer_changes: monitor.subscribe(),
            monitor,
            partner_state: None,
            gate: None,
            follower: None,
            mode_subscription: None,
            hosted_subscription: None,
            target_watch: None,
            hosted: None,
            broadcasting: false,
            joined: None,
        };
        let task = tokio::spawn(actor.run());

        Self {
            user_id: config.user_id,
            sender,
            events,
            mode,
            scheduler,
            feed,
            reporter: Some(reporter),
            cancel_token,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Apply a configured starting role.
    ///
    /// # Errors
    ///
    /// Whatever the corresponding operation returns, e.g. `NotBroadcasting`
    /// when the configured session is not live yet.
    pub async fn apply_role(&self, role: &RoleConfig) -> Result<(), PulseError> {
        match role {
            RoleConfig::Solo => self.select_partner(None).await,
            RoleConfig::Paired { partner_id } => {
                self.select_partner(Some(partner_id.clone())).await
            }
            RoleConfig::Host { session_name } => {
                self.start_broadcast(session_name).await.map(|_| ())
            }
            RoleConfig::Viewer { session_id } => {
                self.join_session(session_id.clone()).await.map(|_| ())
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, PulseError>>) -> NodeMessage,
    ) -> Result<T, PulseError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| PulseError::Internal(format!("node channel send failed: {e}")))?;
        rx.await
            .map_err(|e| PulseError::Internal(format!("response receive failed: {e}")))?
    }

    /// Select (or clear) the partner and announce paired (or solo) mode.
    ///
    /// # Errors
    ///
    /// Store failures, `Internal` if the node has stopped.
    pub async fn select_partner(&self, partner_id: Option<UserId>) -> Result<(), PulseError> {
        self.request(|respond_to| NodeMessage::SelectPartner {
            partner_id,
            respond_to,
        })
        .await
    }

    /// Create (first time) and broadcast this user's session, then announce
    /// group-host mode. While already broadcasting, returns the live
    /// discovery record unchanged.
    ///
    /// # Errors
    ///
    /// Store failures, `Internal` if the node has stopped.
    pub async fn start_broadcast(&self, session_name: &str) -> Result<DiscoveryRecord, PulseError> {
        self.request(|respond_to| NodeMessage::StartBroadcast {
            session_name: session_name.to_string(),
            respond_to,
        })
        .await
    }

    /// Stop broadcasting and announce solo mode. No-op when not
    /// broadcasting.
    ///
    /// # Errors
    ///
    /// Store failures, `Internal` if the node has stopped.
    pub async fn stop_broadcast(&self) -> Result<(), PulseError> {
        self.request(|respond_to| NodeMessage::StopBroadcast { respond_to })
            .await
    }

    /// Join a broadcasting session as viewer and announce group-viewer
    /// mode. Returns the committed viewer count. Joining the session this
    /// node already views returns the current count without counting it
    /// again.
    ///
    /// # Errors
    ///
    /// `NotBroadcasting`, store failures, `Internal` if the node has stopped.
    pub async fn join_session(&self, session_id: SessionId) -> Result<u32, PulseError> {
        self.request(|respond_to| NodeMessage::JoinSession {
            session_id,
            respond_to,
        })
        .await
    }

    /// Leave the joined session and announce solo mode. No-op when not
    /// viewing.
    ///
    /// # Errors
    ///
    /// Store failures, `Internal` if the node has stopped.
    pub async fn leave_session(&self) -> Result<(), PulseError> {
        self.request(|respond_to| NodeMessage::LeaveSession { respond_to })
            .await
    }

    /// Feed a local sensor sample to the scheduler and publish it for
    /// partners and viewers.
    ///
    /// # Errors
    ///
    /// Store failures while publishing (the scheduler was already updated),
    /// `Internal` if the scheduler has stopped.
    pub async fn record_local_rate(&self, bpm: f64) -> Result<(), PulseError> {
        self.scheduler
            .update_rate(bpm, RateSource::LocalSensor)
            .await?;
        self.feed.publish_rate(bpm).await
    }

    /// Report a foreground/background transition of the app.
    pub fn set_app_state(&self, reason: PeerStatusReason) {
        if let Some(reporter) = &self.reporter {
            reporter.set_reason(reason);
        }
    }

    /// Mode, peer-state and pulse notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Follow the resolved mode (`None` until first resolved).
    #[must_use]
    pub fn subscribe_mode(&self) -> watch::Receiver<Option<Mode>> {
        self.mode.clone()
    }

    #[must_use]
    pub fn current_mode(&self) -> Option<Mode> {
        self.mode.borrow().clone()
    }

    #[must_use]
    pub fn scheduler(&self) -> &PulseSchedulerHandle {
        &self.scheduler
    }

    /// Stop the node and wait for its shutdown writes.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(target: "pulse.node", error = %e, "Node actor ended abnormally");
            }
        }
        if let Some(reporter) = self.reporter.take() {
            reporter.shutdown().await;
        }
    }
}

impl Drop for PulseNode {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Next snapshot of an optional subscription; pends forever when absent.
async fn next_snapshot(subscription: Option<&mut Subscription>) -> Option<Snapshot> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn next_discovery(watch: Option<&mut DiscoveryWatch>) -> Option<DiscoveryUpdate> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

struct NodeActor {
    store: SharedStore,
    coordinator: SessionCoordinator,
    user_id: UserId,
    display_name: String,
    liveness: LivenessConfig,
    receiver: mpsc::Receiver<NodeMessage>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<NodeEvent>,
    mode_tx: watch::Sender<Option<Mode>>,
    scheduler: PulseSchedulerHandle,
    pulses: broadcast::Receiver<PulseEvent>,

    inputs: ModeInputs,
    arbiter: ModeArbiter,

    monitor: LivenessMonitor,
    peer_changes: broadcast::Receiver<PeerStateChange>,
    partner_state: Option<PeerState>,

    /// Gate last applied to the scheduler.
    gate: Option<RateSource>,
    follower: Option<RateFollower>,

    mode_subscription: Option<Subscription>,
    /// Session document of the announced hosted session.
    hosted_subscription: Option<(SessionId, Subscription)>,
    /// Discovery record of the announced watched session.
    target_watch: Option<(SessionId, DiscoveryWatch)>,

    /// Session created by this node, reused across broadcasts.
    hosted: Option<Session>,
    broadcasting: bool,
    joined: Option<SessionId>,
}

impl NodeActor {
    #[instrument(skip_all, name = "pulse.node", fields(user_id = %self.user_id))]
    async fn run(mut self) {
        info!(
            target: "pulse.node",
            user_id = %self.user_id,
            local_role = self.inputs.local_role.as_str(),
            "Pulse node started"
        );

        self.reconcile().await;
        self.resubscribe().await;

        let mut resubscribe = tokio::time::interval(RESUBSCRIBE_INTERVAL);
        resubscribe.set_missed_tick_behavior(MissedTickBehavior::Skip);
        resubscribe.tick().await;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(target: "pulse.node", "Node channel closed, exiting");
                        break;
                    };
                    self.handle_message(message).await;
                }

                snapshot = next_snapshot(self.mode_subscription.as_mut()) => {
                    self.on_mode_snapshot(snapshot).await;
                }

                snapshot = next_snapshot(self.hosted_subscription.as_mut().map(|(_, s)| s)) => {
                    self.on_hosted_snapshot(snapshot).await;
                }

                update = next_discovery(self.target_watch.as_mut().map(|(_, w)| w)) => {
                    self.on_discovery_update(update).await;
                }

                change = self.peer_changes.recv() => {
                    self.on_peer_change(change).await;
                }

                event = self.pulses.recv() => {
                    match event {
                        Ok(event) => {
                            // No subscribers is fine
                            let _ = self.events.send(NodeEvent::Pulse(event));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(target: "pulse.node", skipped, "Pulse forwarding lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = resubscribe.tick() => {
                    self.resubscribe().await;
                }
            }
        }

        self.graceful_shutdown().await;
    }

    async fn handle_message(&mut self, message: NodeMessage) {
        match message {
            NodeMessage::SelectPartner {
                partner_id,
                respond_to,
            } => {
                let result = self.select_partner(partner_id).await;
                let _ = respond_to.send(result);
            }
            NodeMessage::StartBroadcast {
                session_name,
                respond_to,
            } => {
                let result = self.start_broadcast(&session_name).await;
                let _ = respond_to.send(result);
            }
            NodeMessage::StopBroadcast { respond_to } => {
                let result = self.stop_broadcast().await;
                let _ = respond_to.send(result);
            }
            NodeMessage::JoinSession {
                session_id,
                respond_to,
            } => {
                let result = self.join_session(session_id).await;
                let _ = respond_to.send(result);
            }
            NodeMessage::LeaveSession { respond_to } => {
                let result = self.leave_session().await;
                let _ = respond_to.send(result);
            }
        }
    }

    async fn select_partner(&mut self, partner_id: Option<UserId>) -> Result<(), PulseError> {
        let announced = if partner_id.is_some() {
            RemoteMode::Paired
        } else {
            RemoteMode::Solo
        };
        self.announce(announced).await?;
        self.inputs.selected_partner = partner_id;
        self.reconcile().await;
        Ok(())
    }

    async fn start_broadcast(&mut self, session_name: &str) -> Result<DiscoveryRecord, PulseError> {
        // Restarting a live broadcast would reset the viewer count.
        if let Some(session) = self.hosted.as_ref().filter(|_| self.broadcasting) {
            let session_id = session.session_id.clone();
            match self.coordinator.get_discovery(&session_id).await {
                Ok(record) => {
                    self.announce(RemoteMode::GroupHost { session_id }).await?;
                    return Ok(record);
                }
                Err(PulseError::NotBroadcasting(_)) => {
                    warn!(
                        target: "pulse.node",
                        session_id = %session_id,
                        "Discovery record missing for live broadcast, republishing"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if self.joined.is_some() {
            self.leave_joined().await?;
        }

        let session = match self.hosted.take() {
            Some(session) => session,
            None => {
                self.coordinator
                    .create_session(&self.user_id, &self.display_name, session_name)
                    .await?
            }
        };
        let session_id = session.session_id.clone();
        let started = self
            .coordinator
            .start_broadcast(&session, &self.user_id)
            .await;
        self.hosted = Some(session);
        let record = started?;
        self.broadcasting = true;

        self.announce(RemoteMode::GroupHost { session_id }).await?;
        Ok(record)
    }

    async fn stop_broadcast(&mut self) -> Result<(), PulseError> {
        let Some(session) = self.hosted.as_ref().filter(|_| self.broadcasting) else {
            return Ok(());
        };
        self.coordinator
            .stop_broadcast(session, &self.user_id)
            .await?;
        self.broadcasting = false;
        self.announce(RemoteMode::Solo).await
    }

    async fn join_session(&mut self, session_id: SessionId) -> Result<u32, PulseError> {
        if self.joined.as_ref() == Some(&session_id) {
            // Already counted; only the announcement is repeated.
            let record = self.coordinator.get_discovery(&session_id).await?;
            self.announce(RemoteMode::GroupViewer { session_id }).await?;
            return Ok(record.viewer_count);
        }
        if self.joined.as_ref().is_some_and(|joined| *joined != session_id) {
            self.leave_joined().await?;
        }
        if self.broadcasting {
            self.stop_broadcast().await?;
        }

        let count = self
            .coordinator
            .join_as_viewer(&session_id, &self.user_id)
            .await?;
        self.joined = Some(session_id.clone());
        self.announce(RemoteMode::GroupViewer { session_id }).await?;
        Ok(count)
    }

    async fn leave_session(&mut self) -> Result<(), PulseError> {
        if self.joined.is_none() {
            return Ok(());
        }
        self.leave_joined().await?;
        self.announce(RemoteMode::Solo).await
    }

    async fn leave_joined(&mut self) -> Result<(), PulseError> {
        if let Some(session_id) = self.joined.take() {
            self.coordinator
                .leave_as_viewer(&session_id, &self.user_id)
                .await?;
        }
        Ok(())
    }

    /// Write the announced mode and apply it locally without waiting for
    /// the subscription to echo it.
    async fn announce(&mut self, mode: RemoteMode) -> Result<(), PulseError> {
        self.store
            .set(
                &StorePath::user_mode(&self.user_id),
                serde_json::to_value(&mode)?,
            )
            .await
            .map_err(|e| {
                warn!(
                    target: "pulse.node",
                    user_id = %self.user_id,
                    error = %e,
                    "Failed to announce mode"
                );
                metrics::record_store_error("mode_set");
                PulseError::Store(e)
            })?;
        self.apply_remote_mode(Some(mode)).await;
        Ok(())
    }

    async fn apply_remote_mode(&mut self, remote: Option<RemoteMode>) {
        if self.inputs.remote_mode == remote {
            return;
        }

        let host_session = |mode: Option<&RemoteMode>| match mode {
            Some(RemoteMode::GroupHost { session_id }) => Some(session_id.clone()),
            _ => None,
        };
        let target_session = |mode: Option<&RemoteMode>| match mode {
            Some(RemoteMode::GroupViewer { session_id }) => Some(session_id.clone()),
            _ => None,
        };

        if host_session(self.inputs.remote_mode.as_ref()) != host_session(remote.as_ref()) {
            self.inputs.flags.own_broadcasting = false;
        }
        if target_session(self.inputs.remote_mode.as_ref()) != target_session(remote.as_ref()) {
            self.inputs.flags.target_broadcasting = false;
            self.inputs.target_host = None;
        }

        debug!(
            target: "pulse.node",
            user_id = %self.user_id,
            remote_mode = ?remote,
            "Announced mode updated"
        );
        self.inputs.remote_mode = remote;
        self.follow_sessions().await;
        self.reconcile().await;
    }

    /// Align the session subscriptions with the announced mode.
    async fn follow_sessions(&mut self) {
        let (host_session, target_session) = match &self.inputs.remote_mode {
            Some(RemoteMode::GroupHost { session_id }) => (Some(session_id.clone()), None),
            Some(RemoteMode::GroupViewer { session_id }) => (None, Some(session_id.clone())),
            _ => (None, None),
        };

        let hosted_stale =
            self.hosted_subscription.as_ref().map(|(id, _)| id) != host_session.as_ref();
        if hosted_stale {
            if let Some((_, subscription)) = self.hosted_subscription.take() {
                self.store.unsubscribe(subscription.id());
            }
            if let Some(session_id) = host_session {
                match self.store.subscribe(&StorePath::session(&session_id)).await {
                    Ok(subscription) => {
                        self.hosted_subscription = Some((session_id, subscription));
                    }
                    Err(e) => {
                        warn!(
                            target: "pulse.node",
                            session_id = %session_id,
                            error = %e,
                            "Session subscription failed, will retry"
                        );
                        metrics::record_store_error("session_subscribe");
                    }
                }
            }
        }

        let target_stale = self.target_watch.as_ref().map(|(id, _)| id) != target_session.as_ref();
        if target_stale {
            if let Some((_, watch)) = self.target_watch.take() {
                self.coordinator.unwatch(&watch);
            }
            if let Some(session_id) = target_session {
                match self.coordinator.watch_discovery(&session_id).await {
                    Ok(watch) => self.target_watch = Some((session_id, watch)),
                    Err(e) => {
                        warn!(
                            target: "pulse.node",
                            session_id = %session_id,
                            error = %e,
                            "Discovery watch failed, will retry"
                        );
                        metrics::record_store_error("discovery_subscribe");
                    }
                }
            }
        }
    }

    async fn resubscribe(&mut self) {
        if self.mode_subscription.is_none() {
            match self
                .store
                .subscribe(&StorePath::user_mode(&self.user_id))
                .await
            {
                Ok(subscription) => self.mode_subscription = Some(subscription),
                Err(e) => {
                    warn!(
                        target: "pulse.node",
                        user_id = %self.user_id,
                        error = %e,
                        "Mode subscription failed, will retry"
                    );
                    metrics::record_store_error("mode_subscribe");
                }
            }
        }
        self.follow_sessions().await;
    }

    async fn on_mode_snapshot(&mut self, snapshot: Option<Snapshot>) {
        let Some(snapshot) = snapshot else {
            self.mode_subscription = None;
            return;
        };
        if !snapshot.exists() {
            self.apply_remote_mode(None).await;
            return;
        }
        match snapshot.decode::<RemoteMode>() {
            Some(mode) => self.apply_remote_mode(Some(mode)).await,
            None => debug!(
                target: "pulse.node",
                user_id = %self.user_id,
                "Malformed mode document ignored"
            ),
        }
    }

    async fn on_hosted_snapshot(&mut self, snapshot: Option<Snapshot>) {
        let Some(snapshot) = snapshot else {
            self.hosted_subscription = None;
            return;
        };
        let own_broadcasting = if snapshot.exists() {
            let Some(session) = snapshot.decode::<Session>() else {
                return;
            };
            session.is_broadcasting && session.host_id == self.user_id
        } else {
            false
        };
        self.inputs.flags.own_broadcasting = own_broadcasting;
        self.reconcile().await;
    }

    async fn on_discovery_update(&mut self, update: Option<DiscoveryUpdate>) {
        match update {
            None => {
                self.target_watch = None;
                return;
            }
            Some(DiscoveryUpdate::Live(record)) => {
                debug!(
                    target: "pulse.node",
                    session_id = %record.session_id,
                    viewer_count = record.viewer_count,
                    "Watched session live"
                );
                self.inputs.flags.target_broadcasting = true;
                self.inputs.target_host = Some(record.host_id);
            }
            Some(DiscoveryUpdate::Ended) => {
                self.inputs.flags.target_broadcasting = false;
            }
        }
        self.reconcile().await;
    }

    async fn on_peer_change(&mut self, change: Result<PeerStateChange, RecvError>) {
        match change {
            Ok(change) => {
                if self.monitor.peer_id().as_ref() != Some(&change.peer_id) {
                    return;
                }
                self.partner_state = Some(change.state);
                let _ = self.events.send(NodeEvent::PeerStateChanged(change));
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(target: "pulse.node", skipped, "Peer state events lagged");
                self.partner_state = self.monitor.current_state();
            }
            Err(RecvError::Closed) => return,
        }
        self.reconcile().await;
    }

    /// Re-resolve the mode, then align liveness monitoring, the scheduler
    /// gate and the rate follower with it.
    async fn reconcile(&mut self) {
        if let Some(mode) = self.arbiter.update(&self.inputs) {
            self.mode_tx.send_replace(Some(mode.clone()));
            let _ = self.events.send(NodeEvent::ModeChanged(mode));
        }
        let Some(mode) = self.arbiter.current().cloned() else {
            return;
        };

        let monitored = match &mode {
            Mode::Paired { partner_id } => Some(partner_id),
            Mode::GroupViewer { host_id } => Some(host_id),
            Mode::Solo | Mode::GroupHost => None,
        };
        if self.monitor.peer_id().as_ref() != monitored {
            self.partner_state = None;
            match monitored {
                Some(peer_id) => {
                    // Changes are read through `peer_changes`.
                    drop(self.monitor.start_monitoring(peer_id.clone(), self.liveness));
                }
                None => self.monitor.stop_monitoring(),
            }
        }

        let gate = pulse_requirement(&mode, self.partner_state);
        self.apply_gate(gate).await;
    }

    async fn apply_gate(&mut self, gate: Option<RateSource>) {
        if self.gate == gate {
            return;
        }
        info!(
            target: "pulse.node",
            from = ?self.gate.as_ref().map(ToString::to_string),
            to = ?gate.as_ref().map(ToString::to_string),
            "Pulse source changed"
        );

        if let Some(follower) = self.follower.take() {
            follower.stop().await;
        }
        if let Err(e) = self.scheduler.set_gate(gate.clone()).await {
            warn!(target: "pulse.node", error = %e, "Failed to update scheduler gate");
        }
        if let Some(RateSource::Remote(remote_user)) = &gate {
            self.follower = Some(RateFeed::follow(
                Arc::clone(&self.store),
                remote_user.clone(),
                self.scheduler.clone(),
            ));
        }
        self.gate = gate;
    }

    async fn graceful_shutdown(&mut self) {
        self.monitor.stop_monitoring();
        if let Some(follower) = self.follower.take() {
            follower.stop().await;
        }
        if let Some(subscription) = self.mode_subscription.take() {
            self.store.unsubscribe(subscription.id());
        }
        if let Some((_, subscription)) = self.hosted_subscription.take() {
            self.store.unsubscribe(subscription.id());
        }
        if let Some((_, watch)) = self.target_watch.take() {
            self.coordinator.unwatch(&watch);
        }

        if let Err(e) = self.leave_joined().await {
            warn!(target: "pulse.node", error = %e, "Failed to leave session on shutdown");
        }
        if self.broadcasting {
            if let Some(session) = &self.hosted {
                if let Err(e) = self.coordinator.stop_broadcast(session, &self.user_id).await {
                    warn!(
                        target: "pulse.node",
                        error = %e,
                        "Failed to stop broadcast on shutdown"
                    );
                }
            }
            self.broadcasting = false;
        }

        self.scheduler.cancel();
        info!(target: "pulse.node", user_id = %self.user_id, "Pulse node stopped");
    }
}
