//! Liveness monitor timing tests
//!
//! Validate termination-by-timeout timing, stop semantics and fencing of
//! late fetches, using a paused tokio clock.

use chrono::Utc;
use pulse_core::liveness::{ChangeCause, LivenessMonitor, PeerStateChange};
use pulse_core::models::PeerState;
use pulse_core::store::InMemoryStore;
use pulse_test_utils::{default_liveness, drain, user, FlakyStore, TestPeer};
use std::sync::Arc;
use std::time::Duration;

fn states(changes: &[PeerStateChange]) -> Vec<(PeerState, ChangeCause)> {
    changes.iter().map(|c| (c.state, c.cause)).collect()
}

/// An active peer that stops updating is terminated on the first timeout
/// tick at or after 60 s, exactly once.
#[tokio::test(start_paused = true)]
async fn test_silent_peer_terminated_on_first_tick_after_timeout() {
    // Arrange
    let store = InMemoryStore::new();
    let peer = TestPeer::new("partner").active();
    peer.write(&store).await;

    let mut monitor = LivenessMonitor::new(Arc::new(store.clone()));
    let mut rx = monitor.start_monitoring(peer.id.clone(), default_liveness());

    // Act - just before the timeout
    tokio::time::sleep(Duration::from_secs(59)).await;

    // Assert
    assert_eq!(
        states(&drain(&mut rx)),
        vec![(PeerState::Active, ChangeCause::Poll)],
        "Only the initial active state before the timeout"
    );

    // Act - the 60 s tick
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        states(&drain(&mut rx)),
        vec![(PeerState::Terminated, ChangeCause::Timeout)]
    );

    // The same stale document keeps being polled; no further emissions
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(drain(&mut rx).is_empty(), "Termination is emitted once");
    assert_eq!(monitor.current_state(), Some(PeerState::Terminated));
}

/// A peer that never wrote a status is treated as unreachable after the
/// timeout.
#[tokio::test(start_paused = true)]
async fn test_missing_peer_times_out() {
    let store = InMemoryStore::new();
    let mut monitor = LivenessMonitor::new(Arc::new(store));
    let mut rx = monitor.start_monitoring(user("ghost"), default_liveness());

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(drain(&mut rx).is_empty(), "Missing document is no update");

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(
        states(&drain(&mut rx)),
        vec![(PeerState::Terminated, ChangeCause::Timeout)]
    );
}

/// Stopping before the timeout suppresses the termination.
#[tokio::test(start_paused = true)]
async fn test_stop_before_timeout_suppresses_termination() {
    let store = InMemoryStore::new();
    let peer = TestPeer::new("partner").active();
    peer.write(&store).await;

    let mut monitor = LivenessMonitor::new(Arc::new(store.clone()));
    let mut rx = monitor.start_monitoring(peer.id.clone(), default_liveness());

    tokio::time::sleep(Duration::from_secs(30)).await;
    monitor.stop_monitoring();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(
        states(&drain(&mut rx)),
        vec![(PeerState::Active, ChangeCause::Poll)]
    );
    assert_eq!(monitor.current_state(), None);
    assert_eq!(monitor.peer_id(), None);
}

/// A fetch that completes after `stop_monitoring` must not emit, and must
/// not leak into a monitoring run started afterwards.
#[tokio::test(start_paused = true)]
async fn test_late_fetch_after_stop_is_dropped() {
    // Arrange - every read takes 5 s
    let memory = InMemoryStore::new();
    TestPeer::new("old-partner").active().write(&memory).await;
    TestPeer::new("new-partner").background().write(&memory).await;

    let store = FlakyStore::new(Arc::new(memory.clone()));
    store.set_get_delay(Duration::from_secs(5));

    let mut monitor = LivenessMonitor::new(Arc::new(store));
    let mut rx = monitor.start_monitoring(user("old-partner"), default_liveness());

    // Act - stop while the first read is in flight, then monitor someone else
    tokio::time::sleep(Duration::from_secs(1)).await;
    monitor.stop_monitoring();
    let _new_rx = monitor.start_monitoring(user("new-partner"), default_liveness());
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Assert - only the new peer's state arrived
    let changes = drain(&mut rx);
    assert_eq!(changes.len(), 1, "Unexpected changes: {changes:?}");
    let change = changes.first().unwrap();
    assert_eq!(change.peer_id, user("new-partner"));
    assert_eq!(change.state, PeerState::Background);
}

/// Fresh heartbeats keep an active peer alive past the timeout.
#[tokio::test(start_paused = true)]
async fn test_fresh_heartbeats_prevent_timeout() {
    let store = InMemoryStore::new();
    let peer = TestPeer::new("partner").active();
    peer.write(&store).await;

    let mut monitor = LivenessMonitor::new(Arc::new(store.clone()));
    let mut rx = monitor.start_monitoring(peer.id.clone(), default_liveness());

    // The peer heartbeats every 10 s for three minutes
    for beat in 1..=18 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        TestPeer::new("partner")
            .active()
            .with_heartbeat(Utc::now() + chrono::Duration::milliseconds(beat))
            .write(&store)
            .await;
    }

    assert_eq!(
        states(&drain(&mut rx)),
        vec![(PeerState::Active, ChangeCause::Poll)]
    );
    assert_eq!(monitor.current_state(), Some(PeerState::Active));
}
