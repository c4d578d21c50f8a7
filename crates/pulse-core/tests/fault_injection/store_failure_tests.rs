//! Store failure tests
//!
//! Transient store errors are swallowed by the periodic loops and retried
//! on the next tick; request-style operations surface them to the caller
//! without corrupting state.

use pulse_core::errors::PulseError;
use pulse_core::liveness::LivenessMonitor;
use pulse_core::models::{DiscoveryRecord, Mode, PeerState};
use pulse_core::node::{NodeConfig, PulseNode};
use pulse_core::pulse::{PulseSchedulerHandle, RateFeed, RateSource, SchedulerState};
use pulse_core::session::SessionCoordinator;
use pulse_core::store::{InMemoryStore, RemoteStore, StorePath};
use pulse_test_utils::{
    default_liveness, drain, fine_scheduler, user, write_heart_rate, FlakyStore, StoreOp, TestPeer,
};
use std::sync::Arc;
use std::time::Duration;

/// Failed status reads produce no update; the next successful poll does.
#[tokio::test(start_paused = true)]
async fn test_liveness_recovers_after_failed_polls() {
    // Arrange - the first two polls (t=0, t=15) fail
    let memory = InMemoryStore::new();
    let peer = TestPeer::new("partner").active();
    peer.write(&memory).await;
    let store = FlakyStore::new(Arc::new(memory.clone()));
    store.fail_next(StoreOp::Get, 2);

    let mut monitor = LivenessMonitor::new(Arc::new(store.clone()));
    let mut rx = monitor.start_monitoring(peer.id.clone(), default_liveness());

    // Act / Assert
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(drain(&mut rx).is_empty(), "Failed reads must not emit");
    assert_eq!(store.call_count(StoreOp::Get), 2);

    tokio::time::sleep(Duration::from_secs(15)).await;
    let changes = drain(&mut rx);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes.first().unwrap().state, PeerState::Active);
}

/// A failed increment surfaces a transient error and leaves the count
/// untouched; retrying succeeds.
#[tokio::test]
async fn test_failed_join_leaves_count_unchanged() {
    // Arrange
    let memory = InMemoryStore::new();
    let store = FlakyStore::new(Arc::new(memory.clone()));
    let coordinator = SessionCoordinator::new(Arc::new(store.clone()));
    let host = user("host");
    let session = coordinator
        .create_session(&host, "Host", "Flaky")
        .await
        .unwrap();
    coordinator.start_broadcast(&session, &host).await.unwrap();

    // Act
    store.fail_next(StoreOp::Transact, 1);
    let failed = coordinator
        .join_as_viewer(&session.session_id, &user("viewer"))
        .await;

    // Assert
    let error = failed.unwrap_err();
    assert!(matches!(error, PulseError::Store(_)));
    assert!(error.is_transient());
    let record: DiscoveryRecord = memory
        .get(&StorePath::discovery(&session.session_id))
        .await
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(record.viewer_count, 0);

    let count = coordinator
        .join_as_viewer(&session.session_id, &user("viewer"))
        .await
        .unwrap();
    assert_eq!(count, 1);
}

/// The rate follower retries a failed subscription.
#[tokio::test(start_paused = true)]
async fn test_rate_follower_retries_subscribe() {
    // Arrange
    let memory = InMemoryStore::new();
    let partner = user("partner");
    write_heart_rate(&memory, &partner, 80.0).await;
    let store = FlakyStore::new(Arc::new(memory.clone()));
    store.fail_next(StoreOp::Subscribe, 1);

    let scheduler = PulseSchedulerHandle::new(fine_scheduler());
    scheduler
        .set_gate(Some(RateSource::Remote(partner.clone())))
        .await
        .unwrap();

    // Act
    let follower = RateFeed::follow(Arc::new(store.clone()), partner, scheduler.clone());
    scheduler
        .subscribe_status()
        .wait_for(|status| status.state == SchedulerState::Running)
        .await
        .unwrap();

    // Assert
    assert_eq!(store.call_count(StoreOp::Subscribe), 2);

    follower.stop().await;
    assert_eq!(memory.subscriber_count(), 0);
    scheduler.cancel();
}

/// A failed mode announcement is reported and the node keeps working.
#[tokio::test(start_paused = true)]
async fn test_failed_announcement_keeps_previous_mode() {
    // Arrange
    let memory = InMemoryStore::new();
    let store = FlakyStore::new(Arc::new(memory.clone()));
    let node = PulseNode::start(Arc::new(store.clone()), NodeConfig::new(user("me")));
    node.subscribe_mode()
        .wait_for(|mode| mode.as_ref() == Some(&Mode::Solo))
        .await
        .unwrap();

    // Act
    store.fail_always(StoreOp::Set, true);
    let result = node.select_partner(Some(user("partner"))).await;

    // Assert
    assert!(matches!(result, Err(PulseError::Store(_))));
    assert_eq!(node.current_mode(), Some(Mode::Solo));

    store.fail_always(StoreOp::Set, false);
    node.select_partner(Some(user("partner"))).await.unwrap();
    node.subscribe_mode()
        .wait_for(|mode| {
            mode.as_ref()
                == Some(&Mode::Paired {
                    partner_id: user("partner"),
                })
        })
        .await
        .unwrap();

    node.shutdown().await;
}
