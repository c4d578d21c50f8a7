//! Pre-configured test data for Pulse Link tests.
//!
//! Provides:
//! - Identifier helpers that panic on invalid input
//! - `TestPeer` builder for peer status documents
//! - Liveness and scheduler configurations with test-friendly timings

use chrono::{DateTime, Utc};
use common::types::{SessionId, UserId};
use pulse_core::liveness::LivenessConfig;
use pulse_core::models::{HeartRateRecord, PeerStatus, PeerStatusReason};
use pulse_core::pulse::SchedulerConfig;
use pulse_core::store::{RemoteStore, StorePath};
use std::time::Duration;
use uuid::Uuid;

/// Build a `UserId`, panicking on invalid input.
#[must_use]
pub fn user(id: &str) -> UserId {
    UserId::new(id).expect("valid test user id")
}

/// A user ID unique to this test run.
#[must_use]
pub fn random_user(prefix: &str) -> UserId {
    user(&format!("{prefix}-{}", Uuid::new_v4()))
}

/// Build a `SessionId`, panicking on invalid input.
#[must_use]
pub fn session(id: &str) -> SessionId {
    SessionId::new(id).expect("valid test session id")
}

/// Poll 15 s, timeout 60 s.
#[must_use]
pub fn default_liveness() -> LivenessConfig {
    LivenessConfig {
        poll_interval: Duration::from_secs(15),
        heartbeat_timeout: Duration::from_secs(60),
    }
}

/// 10 ms check tick for tight timing assertions.
#[must_use]
pub fn fine_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        check_tick: Duration::from_millis(10),
        ..SchedulerConfig::default()
    }
}

/// Builder for a peer's status document.
#[derive(Debug, Clone)]
pub struct TestPeer {
    pub id: UserId,
    pub is_active: bool,
    pub reason: PeerStatusReason,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl TestPeer {
    /// Foreground peer with a heartbeat from now.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: user(id),
            is_active: true,
            reason: PeerStatusReason::Foreground,
            last_heartbeat_at: Some(Utc::now()),
        }
    }

    #[must_use]
    pub fn active(mut self) -> Self {
        self.is_active = true;
        self.reason = PeerStatusReason::Foreground;
        self
    }

    #[must_use]
    pub fn background(mut self) -> Self {
        self.is_active = false;
        self.reason = PeerStatusReason::Background;
        self
    }

    #[must_use]
    pub fn terminated(mut self) -> Self {
        self.is_active = false;
        self.reason = PeerStatusReason::Terminated;
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat_at = Some(at);
        self
    }

    #[must_use]
    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            peer_id: self.id.clone(),
            is_active: self.is_active,
            last_heartbeat_at: self.last_heartbeat_at,
            reason: self.reason,
        }
    }

    /// Write the status document to `store`.
    pub async fn write(&self, store: &impl RemoteStore) {
        store
            .set(
                &StorePath::peer_status(&self.id),
                serde_json::to_value(self.status()).expect("status encodes"),
            )
            .await
            .expect("status write succeeds");
    }
}

/// Write `bpm` as `user_id`'s latest heart rate.
pub async fn write_heart_rate(store: &impl RemoteStore, user_id: &UserId, bpm: f64) {
    let record = HeartRateRecord {
        bpm,
        measured_at: Utc::now(),
    };
    store
        .set(
            &StorePath::heart_rate(user_id),
            serde_json::to_value(record).expect("record encodes"),
        )
        .await
        .expect("heart rate write succeeds");
}
