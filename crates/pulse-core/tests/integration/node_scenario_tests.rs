//! End-to-end node scenarios over a shared in-memory store
//!
//! Each test runs one or more `PulseNode`s against the same store, the way
//! separate devices share the remote store in production.

use pulse_core::models::{DiscoveryRecord, Mode, PeerState};
use pulse_core::node::{NodeConfig, NodeEvent, PulseNode};
use pulse_core::pulse::{beat_interval, RateSource, SchedulerState};
use pulse_core::session::SessionCoordinator;
use pulse_core::store::{InMemoryStore, RemoteStore, StorePath};
use pulse_test_utils::{collect_for, fine_scheduler, user, TestPeer};
use std::sync::Arc;
use std::time::Duration;

fn node(store: &InMemoryStore, id: &str) -> PulseNode {
    let mut config = NodeConfig::new(user(id));
    config.scheduler = fine_scheduler();
    PulseNode::start(Arc::new(store.clone()), config)
}

async fn wait_for_mode(node: &PulseNode, expected: &Mode) {
    node.subscribe_mode()
        .wait_for(|mode| mode.as_ref() == Some(expected))
        .await
        .unwrap();
}

async fn wait_for_source(node: &PulseNode, source: &RateSource) {
    node.scheduler()
        .subscribe_status()
        .wait_for(|status| status.source.as_ref() == Some(source))
        .await
        .unwrap();
}

async fn wait_for_state(node: &PulseNode, state: SchedulerState) {
    node.scheduler()
        .subscribe_status()
        .wait_for(|status| status.state == state)
        .await
        .unwrap();
}

/// A host starts broadcasting with a local rate of 72: the discovery record
/// appears with zero viewers and the scheduler goes from idle to running at
/// ~0.833 s per beat.
#[tokio::test(start_paused = true)]
async fn test_host_starts_broadcasting_at_72_bpm() {
    // Arrange
    let store = InMemoryStore::new();
    let host = node(&store, "host");
    wait_for_source(&host, &RateSource::LocalSensor).await;
    assert_eq!(host.scheduler().status().state, SchedulerState::Idle);

    // Act
    let record = host.start_broadcast("Tempo run").await.unwrap();
    host.record_local_rate(72.0).await.unwrap();

    // Assert
    assert_eq!(record.viewer_count, 0);
    assert_eq!(record.host_id, user("host"));
    let listed: DiscoveryRecord = store
        .get(&StorePath::discovery(&record.session_id))
        .await
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(listed.viewer_count, 0);
    let coordinator = SessionCoordinator::new(Arc::new(store.clone()));
    assert_eq!(coordinator.list_discoverable().await.unwrap(), vec![listed]);

    wait_for_mode(&host, &Mode::GroupHost).await;
    wait_for_state(&host, SchedulerState::Running).await;
    let interval = host.scheduler().status().interval.unwrap();
    assert_eq!(interval, beat_interval(72.0));
    assert!((interval.as_secs_f64() - 0.8333).abs() < 0.001);

    host.shutdown().await;
}

/// A viewer joins a live broadcast, is counted, and follows the host's rate.
#[tokio::test(start_paused = true)]
async fn test_viewer_follows_host_rate() {
    // Arrange
    let store = InMemoryStore::new();
    let host = node(&store, "host");
    wait_for_source(&host, &RateSource::LocalSensor).await;
    let record = host.start_broadcast("Hill repeats").await.unwrap();
    host.record_local_rate(150.0).await.unwrap();

    // Act
    let viewer = node(&store, "viewer");
    let count = viewer.join_session(record.session_id.clone()).await.unwrap();

    // Assert
    assert_eq!(count, 1);
    wait_for_mode(
        &viewer,
        &Mode::GroupViewer {
            host_id: user("host"),
        },
    )
    .await;
    wait_for_source(&viewer, &RateSource::Remote(user("host"))).await;
    wait_for_state(&viewer, SchedulerState::Running).await;
    assert_eq!(
        viewer.scheduler().status().interval,
        Some(beat_interval(150.0))
    );

    // Leaving drops the count and returns to solo
    viewer.leave_session().await.unwrap();
    wait_for_mode(&viewer, &Mode::Solo).await;
    let listed: DiscoveryRecord = store
        .get(&StorePath::discovery(&record.session_id))
        .await
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(listed.viewer_count, 0);

    viewer.shutdown().await;
    host.shutdown().await;
}

async fn listed_count(store: &InMemoryStore, record: &DiscoveryRecord) -> u32 {
    let listed: DiscoveryRecord = store
        .get(&StorePath::discovery(&record.session_id))
        .await
        .unwrap()
        .decode()
        .unwrap();
    listed.viewer_count
}

/// Joining the same session twice counts the viewer once, so a single
/// leave brings the count back to zero.
#[tokio::test(start_paused = true)]
async fn test_repeat_join_counts_viewer_once() {
    let store = InMemoryStore::new();
    let host = node(&store, "host");
    let record = host.start_broadcast("Threshold").await.unwrap();
    let viewer = node(&store, "viewer");

    let first = viewer.join_session(record.session_id.clone()).await.unwrap();
    let second = viewer.join_session(record.session_id.clone()).await.unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 1);
    assert_eq!(listed_count(&store, &record).await, 1);
    wait_for_mode(
        &viewer,
        &Mode::GroupViewer {
            host_id: user("host"),
        },
    )
    .await;

    viewer.leave_session().await.unwrap();
    assert_eq!(listed_count(&store, &record).await, 0);

    viewer.shutdown().await;
    host.shutdown().await;
}

/// Starting a broadcast that is already live keeps the viewers counted.
#[tokio::test(start_paused = true)]
async fn test_repeat_start_broadcast_keeps_viewer_count() {
    let store = InMemoryStore::new();
    let host = node(&store, "host");
    let record = host.start_broadcast("Long ride").await.unwrap();
    let viewer = node(&store, "viewer");
    viewer.join_session(record.session_id.clone()).await.unwrap();

    let again = host.start_broadcast("Long ride").await.unwrap();

    assert_eq!(again.session_id, record.session_id);
    assert_eq!(again.viewer_count, 1);
    assert_eq!(listed_count(&store, &record).await, 1);
    wait_for_mode(&host, &Mode::GroupHost).await;

    // The later leave lands on the preserved count
    viewer.leave_session().await.unwrap();
    assert_eq!(listed_count(&store, &record).await, 0);

    viewer.shutdown().await;
    host.shutdown().await;
}

/// When the host stops broadcasting, the viewer falls back to solo.
#[tokio::test(start_paused = true)]
async fn test_viewer_falls_back_when_broadcast_ends() {
    let store = InMemoryStore::new();
    let host = node(&store, "host");
    let record = host.start_broadcast("Cooldown").await.unwrap();

    let viewer = node(&store, "viewer");
    viewer.join_session(record.session_id.clone()).await.unwrap();
    wait_for_mode(
        &viewer,
        &Mode::GroupViewer {
            host_id: user("host"),
        },
    )
    .await;

    host.stop_broadcast().await.unwrap();

    wait_for_mode(&viewer, &Mode::Solo).await;
    wait_for_source(&viewer, &RateSource::LocalSensor).await;

    viewer.shutdown().await;
    host.shutdown().await;
}

/// A paired partner going silent pauses the pulse after the liveness
/// timeout, and the node reports the partner as terminated.
#[tokio::test(start_paused = true)]
async fn test_paired_partner_timeout_pauses_pulse() {
    // Arrange
    let store = InMemoryStore::new();
    let partner = TestPeer::new("partner").active();
    partner.write(&store).await;
    pulse_test_utils::write_heart_rate(&store, &partner.id, 64.0).await;

    let me = node(&store, "me");
    let mut events = me.subscribe();

    // Act
    me.select_partner(Some(partner.id.clone())).await.unwrap();
    wait_for_state(&me, SchedulerState::Running).await;

    // Assert - no further heartbeats from the partner
    let collected = collect_for(&mut events, Duration::from_secs(75)).await;
    let terminated = collected.iter().any(|event| {
        matches!(
            event,
            NodeEvent::PeerStateChanged(change)
                if change.peer_id == partner.id && change.state == PeerState::Terminated
        )
    });
    assert!(terminated, "Partner should be reported terminated");
    assert_eq!(me.scheduler().status().source, None);
    assert_ne!(me.scheduler().status().state, SchedulerState::Running);

    me.shutdown().await;
}
