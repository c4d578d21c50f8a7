//! Heart-rate publishing and remote rate following.

use super::scheduler::{PulseSchedulerHandle, RateSource};
use crate::errors::PulseError;
use crate::models::{local_instant, HeartRateRecord};
use crate::observability::metrics;
use crate::store::{SharedStore, StorePath};
use chrono::Utc;
use common::types::UserId;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Delay before re-subscribing after a failed subscribe.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Publishes this user's heart rate to `user:{id}:heart_rate`.
#[derive(Clone)]
pub struct RateFeed {
    store: SharedStore,
    user_id: UserId,
}

impl RateFeed {
    #[must_use]
    pub fn new(store: SharedStore, user_id: UserId) -> Self {
        Self { store, user_id }
    }

    /// Write the latest local sample.
    ///
    /// # Errors
    ///
    /// Store failures (logged, not retried).
    #[instrument(skip_all, fields(user_id = %self.user_id))]
    pub async fn publish_rate(&self, bpm: f64) -> Result<(), PulseError> {
        let record = HeartRateRecord {
            bpm,
            measured_at: Utc::now(),
        };
        self.store
            .set(
                &StorePath::heart_rate(&self.user_id),
                serde_json::to_value(record)?,
            )
            .await
            .map_err(|e| {
                warn!(
                    target: "pulse.rate",
                    user_id = %self.user_id,
                    error = %e,
                    "Failed to publish heart rate"
                );
                metrics::record_store_error("heart_rate_set");
                PulseError::Store(e)
            })
    }

    /// Follow `remote_user`'s published rate and feed it to the scheduler as
    /// `RateSource::Remote(remote_user)`.
    #[must_use]
    pub fn follow(
        store: SharedStore,
        remote_user: UserId,
        scheduler: PulseSchedulerHandle,
    ) -> RateFollower {
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(follow_loop(
            store,
            remote_user.clone(),
            scheduler,
            cancel_token.clone(),
        ));
        RateFollower {
            remote_user,
            cancel_token,
            task: Some(task),
        }
    }
}

/// Running follower of a remote rate. Stopped on drop.
pub struct RateFollower {
    remote_user: UserId,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RateFollower {
    #[must_use]
    pub fn remote_user(&self) -> &UserId {
        &self.remote_user
    }

    /// Stop following and wait for the task to unsubscribe.
    pub async fn stop(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(target: "pulse.rate", error = %e, "Rate follower ended abnormally");
            }
        }
    }
}

impl Drop for RateFollower {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn follow_loop(
    store: SharedStore,
    remote_user: UserId,
    scheduler: PulseSchedulerHandle,
    cancel_token: CancellationToken,
) {
    let path = StorePath::heart_rate(&remote_user);
    let source = RateSource::Remote(remote_user.clone());

    loop {
        let mut subscription = tokio::select! {
            () = cancel_token.cancelled() => return,
            result = store.subscribe(&path) => match result {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(
                        target: "pulse.rate",
                        remote_user = %remote_user,
                        error = %e,
                        "Rate subscription failed, will retry"
                    );
                    metrics::record_store_error("heart_rate_subscribe");
                    tokio::select! {
                        () = cancel_token.cancelled() => return,
                        () = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
            },
        };

        info!(
            target: "pulse.rate",
            remote_user = %remote_user,
            "Following remote heart rate"
        );

        loop {
            let snapshot = tokio::select! {
                () = cancel_token.cancelled() => {
                    store.unsubscribe(subscription.id());
                    return;
                }
                snapshot = subscription.next() => snapshot,
            };
            let Some(snapshot) = snapshot else {
                debug!(
                    target: "pulse.rate",
                    remote_user = %remote_user,
                    "Rate subscription ended, resubscribing"
                );
                break;
            };
            let Some(record) = snapshot.decode::<HeartRateRecord>() else {
                continue;
            };
            let observed_at = local_instant(Some(record.measured_at));
            if scheduler
                .update_rate_at(record.bpm, source.clone(), observed_at)
                .await
                .is_err()
            {
                // Scheduler gone: nothing left to feed.
                store.unsubscribe(subscription.id());
                return;
            }
        }

        tokio::select! {
            () = cancel_token.cancelled() => return,
            () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pulse::scheduler::{SchedulerConfig, SchedulerState};
    use crate::store::{InMemoryStore, RemoteStore};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_publish_writes_record() {
        let store = InMemoryStore::new();
        let user = UserId::new("runner").unwrap();
        let feed = RateFeed::new(Arc::new(store.clone()), user.clone());

        feed.publish_rate(88.0).await.unwrap();

        let record: HeartRateRecord = store
            .get(&StorePath::heart_rate(&user))
            .await
            .unwrap()
            .decode()
            .unwrap();
        assert!((record.bpm - 88.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_drives_scheduler() {
        let store = InMemoryStore::new();
        let partner = UserId::new("partner").unwrap();
        let scheduler = PulseSchedulerHandle::new(SchedulerConfig::default());
        scheduler
            .set_gate(Some(RateSource::Remote(partner.clone())))
            .await
            .unwrap();

        let follower = RateFeed::follow(Arc::new(store.clone()), partner.clone(), scheduler.clone());
        RateFeed::new(Arc::new(store.clone()), partner)
            .publish_rate(75.0)
            .await
            .unwrap();

        let mut status = scheduler.subscribe_status();
        status
            .wait_for(|s| s.state == SchedulerState::Running)
            .await
            .unwrap();

        follower.stop().await;
        assert_eq!(store.subscriber_count(), 0);
        scheduler.cancel();
    }
}
