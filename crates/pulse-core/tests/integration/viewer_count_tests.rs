//! Viewer count consistency under concurrent joins and leaves
//!
//! The count on the discovery record is only changed through `transact`,
//! so any interleaving of K joins and J leaves (each leave after its own
//! join) must end at K - J.

use common::types::{SessionId, UserId};
use futures::future::join_all;
use pulse_core::errors::PulseError;
use pulse_core::models::DiscoveryRecord;
use pulse_core::session::SessionCoordinator;
use pulse_core::store::{InMemoryStore, RemoteStore, StorePath};
use pulse_test_utils::user;
use proptest::prelude::*;
use std::sync::Arc;

async fn broadcasting_session(store: &InMemoryStore) -> (SessionCoordinator, SessionId) {
    let coordinator = SessionCoordinator::new(Arc::new(store.clone()));
    let host = user("host");
    let session = coordinator
        .create_session(&host, "Host", "Intervals")
        .await
        .unwrap();
    let record = coordinator.start_broadcast(&session, &host).await.unwrap();
    assert_eq!(record.viewer_count, 0);
    (coordinator, session.session_id)
}

async fn viewer_count(store: &InMemoryStore, session_id: &SessionId) -> u32 {
    let record: DiscoveryRecord = store
        .get(&StorePath::discovery(session_id))
        .await
        .unwrap()
        .decode()
        .expect("discovery record present");
    record.viewer_count
}

fn viewer(index: usize) -> UserId {
    user(&format!("viewer-{index}"))
}

/// Two viewers joining at the same time both get counted.
#[tokio::test]
async fn test_two_concurrent_joins_count_two() {
    let store = InMemoryStore::new();
    let (coordinator, session_id) = broadcasting_session(&store).await;

    let (viewer_1, viewer_2) = (viewer(1), viewer(2));
    let (first, second) = tokio::join!(
        coordinator.join_as_viewer(&session_id, &viewer_1),
        coordinator.join_as_viewer(&session_id, &viewer_2),
    );

    let mut committed = vec![first.unwrap(), second.unwrap()];
    committed.sort_unstable();
    assert_eq!(committed, vec![1, 2], "Each join commits a distinct count");
    assert_eq!(viewer_count(&store, &session_id).await, 2);
}

/// Joins racing on worker threads are all counted.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_joins_on_worker_threads() {
    let store = InMemoryStore::new();
    let (coordinator, session_id) = broadcasting_session(&store).await;

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let coordinator = coordinator.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { coordinator.join_as_viewer(&session_id, &viewer(i)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(viewer_count(&store, &session_id).await, 16);
}

/// A large crowd joining at once is fully counted; no join gives up on
/// contention.
#[tokio::test]
async fn test_two_hundred_simultaneous_joins_are_all_counted() {
    let store = InMemoryStore::new();
    let (coordinator, session_id) = broadcasting_session(&store).await;
    let viewers: Vec<UserId> = (0..200).map(viewer).collect();

    let results = join_all(
        viewers
            .iter()
            .map(|viewer_id| coordinator.join_as_viewer(&session_id, viewer_id)),
    )
    .await;

    for result in &results {
        assert!(result.is_ok(), "join failed: {result:?}");
    }
    assert_eq!(viewer_count(&store, &session_id).await, 200);
}

/// Same crowd spread across worker threads.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_two_hundred_parallel_joins_on_worker_threads() {
    let store = InMemoryStore::new();
    let (coordinator, session_id) = broadcasting_session(&store).await;

    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let coordinator = coordinator.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { coordinator.join_as_viewer(&session_id, &viewer(i)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(viewer_count(&store, &session_id).await, 200);
}

/// Extra leaves clamp at zero instead of going negative.
#[tokio::test]
async fn test_leave_clamps_at_zero() {
    let store = InMemoryStore::new();
    let (coordinator, session_id) = broadcasting_session(&store).await;

    coordinator
        .join_as_viewer(&session_id, &viewer(1))
        .await
        .unwrap();
    assert_eq!(
        coordinator
            .leave_as_viewer(&session_id, &viewer(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        coordinator
            .leave_as_viewer(&session_id, &viewer(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(viewer_count(&store, &session_id).await, 0);
}

/// Joining a session that is not broadcasting fails and leaves no
/// registration behind.
#[tokio::test]
async fn test_join_without_broadcast_is_rejected() {
    let store = InMemoryStore::new();
    let coordinator = SessionCoordinator::new(Arc::new(store.clone()));
    let host = user("host");
    let session = coordinator
        .create_session(&host, "Host", "Not yet")
        .await
        .unwrap();

    let result = coordinator
        .join_as_viewer(&session.session_id, &viewer(1))
        .await;

    assert!(matches!(result, Err(PulseError::NotBroadcasting(_))));
    assert!(!store
        .get(&StorePath::viewer_registration(&session.session_id, &viewer(1)))
        .await
        .unwrap()
        .exists());
    assert!(!store
        .get(&StorePath::discovery(&session.session_id))
        .await
        .unwrap()
        .exists());
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

    #[test]
    fn prop_viewer_count_is_joins_minus_leaves(
        joins in 1usize..12,
        leaves in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let expected = u32::try_from(
            joins - leaves.iter().take(joins).filter(|leave| **leave).count(),
        )
        .unwrap();

        let count = runtime.block_on(async {
            let store = InMemoryStore::new();
            let (coordinator, session_id) = broadcasting_session(&store).await;

            join_all((0..joins).map(|i| {
                let coordinator = coordinator.clone();
                let session_id = session_id.clone();
                let leaves_again = leaves.get(i).copied().unwrap_or(false);
                async move {
                    coordinator.join_as_viewer(&session_id, &viewer(i)).await.unwrap();
                    if leaves_again {
                        tokio::task::yield_now().await;
                        coordinator.leave_as_viewer(&session_id, &viewer(i)).await.unwrap();
                    }
                }
            }))
            .await;

            viewer_count(&store, &session_id).await
        });

        prop_assert_eq!(count, expected);
    }
}
