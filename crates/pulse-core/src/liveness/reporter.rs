//! Producer side of liveness: keeps this device's `PeerStatus` fresh.

use crate::models::{PeerStatus, PeerStatusReason};
use crate::observability::metrics;
use crate::store::{SharedStore, StorePath};
use chrono::Utc;
use common::types::PeerId;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default heartbeat write interval. Must stay well below the observers'
/// heartbeat timeout.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Writes `peer:{id}:status` on every heartbeat and on every reason change.
///
/// [`PeerStatusReporter::shutdown`] writes a final `Terminated` status.
pub struct PeerStatusReporter {
    reason: watch::Sender<PeerStatusReason>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl PeerStatusReporter {
    /// Start reporting as foreground.
    #[must_use]
    pub fn start(store: SharedStore, peer_id: PeerId, heartbeat_interval: Duration) -> Self {
        let (reason, reason_rx) = watch::channel(PeerStatusReason::Foreground);
        let cancel_token = CancellationToken::new();

        let task = tokio::spawn(run(
            store,
            peer_id,
            heartbeat_interval,
            reason_rx,
            cancel_token.clone(),
        ));

        Self {
            reason,
            cancel_token,
            task,
        }
    }

    /// Report a lifecycle change (foreground/background). Written immediately.
    pub fn set_reason(&self, reason: PeerStatusReason) {
        self.reason.send_if_modified(|current| {
            if *current == reason {
                false
            } else {
                *current = reason;
                true
            }
        });
    }

    /// Stop heartbeating and write the final `Terminated` status.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            warn!(
                target: "pulse.liveness",
                error = %e,
                "Status reporter task ended abnormally"
            );
        }
    }
}

async fn run(
    store: SharedStore,
    peer_id: PeerId,
    heartbeat_interval: Duration,
    mut reason_rx: watch::Receiver<PeerStatusReason>,
    cancel_token: CancellationToken,
) {
    let path = StorePath::peer_status(&peer_id);
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        target: "pulse.liveness",
        peer_id = %peer_id,
        heartbeat_interval_s = heartbeat_interval.as_secs_f64(),
        "Status reporter started"
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
            changed = reason_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let reason = *reason_rx.borrow_and_update();
        write_status(&store, &path, &peer_id, reason).await;
    }

    write_status(&store, &path, &peer_id, PeerStatusReason::Terminated).await;
    info!(
        target: "pulse.liveness",
        peer_id = %peer_id,
        "Status reporter stopped"
    );
}

async fn write_status(
    store: &SharedStore,
    path: &StorePath,
    peer_id: &PeerId,
    reason: PeerStatusReason,
) {
    let status = PeerStatus {
        peer_id: peer_id.clone(),
        is_active: reason == PeerStatusReason::Foreground,
        last_heartbeat_at: Some(Utc::now()),
        reason,
    };

    let value = match serde_json::to_value(&status) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "pulse.liveness", error = %e, "Failed to encode peer status");
            return;
        }
    };

    match store.set(path, value).await {
        Ok(()) => debug!(
            target: "pulse.liveness",
            peer_id = %peer_id,
            reason = ?reason,
            "Heartbeat written"
        ),
        Err(e) => {
            warn!(
                target: "pulse.liveness",
                peer_id = %peer_id,
                error = %e,
                "Heartbeat write failed, will retry on next tick"
            );
            metrics::record_store_error("peer_status_set");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, RemoteStore};
    use common::types::UserId;
    use std::sync::Arc;

    async fn read(store: &InMemoryStore, peer: &PeerId) -> PeerStatus {
        store
            .get(&StorePath::peer_status(peer))
            .await
            .unwrap()
            .decode()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_lifecycle() {
        let store = InMemoryStore::new();
        let peer = UserId::new("phone-1").unwrap();

        let reporter =
            PeerStatusReporter::start(Arc::new(store.clone()), peer.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = read(&store, &peer).await;
        assert!(status.is_active);
        assert_eq!(status.reason, PeerStatusReason::Foreground);

        reporter.set_reason(PeerStatusReason::Background);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = read(&store, &peer).await;
        assert!(!status.is_active);
        assert_eq!(status.reason, PeerStatusReason::Background);

        reporter.shutdown().await;
        let status = read(&store, &peer).await;
        assert!(!status.is_active);
        assert_eq!(status.reason, PeerStatusReason::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timestamp_advances() {
        let store = InMemoryStore::new();
        let peer = UserId::new("phone-2").unwrap();
        let mut sub = store.subscribe(&StorePath::peer_status(&peer)).await.unwrap();
        assert!(!sub.next().await.unwrap().exists());

        let reporter =
            PeerStatusReporter::start(Arc::new(store.clone()), peer.clone(), Duration::from_secs(10));

        let first: PeerStatus = sub.next().await.unwrap().decode().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let second: PeerStatus = sub.next().await.unwrap().decode().unwrap();
        assert!(second.last_heartbeat_at >= first.last_heartbeat_at);

        reporter.shutdown().await;
    }
}
