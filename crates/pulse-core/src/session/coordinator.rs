//! Session lifecycle and viewer accounting.
//!
//! # Viewer count
//!
//! `viewer_count` on the discovery record is the only aggregate, and it is
//! only ever changed through [`RemoteStore::transact`]. It is never derived
//! from the registrations, so a failed decrement leaves the count one too
//! high until the broadcast is stopped (which deletes the record).
//!
//! # Failures
//!
//! Every write is attempted once. Failures are logged and returned to the
//! caller; nothing here retries.

use crate::errors::PulseError;
use crate::models::{DiscoveryRecord, Session, ViewerRegistration};
use crate::observability::metrics;
use crate::store::{SharedStore, Snapshot, StoreError, StorePath, Subscription, SubscriptionId};
use chrono::Utc;
use common::types::{SessionId, UserId};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// Result of comparing a session's broadcast flag with its discovery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastConsistency {
    Consistent,
    /// Session says broadcasting but no discovery record exists.
    MissingDiscovery,
    /// Discovery record exists but the session is not broadcasting.
    OrphanedDiscovery,
}

/// One observation of a watched discovery record.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryUpdate {
    Live(DiscoveryRecord),
    /// Record absent: the broadcast is not (or no longer) live.
    Ended,
}

/// Follows one session's discovery record.
#[derive(Debug)]
pub struct DiscoveryWatch {
    subscription: Subscription,
}

impl DiscoveryWatch {
    /// Next update; `None` once the subscription is cancelled.
    /// Malformed records are skipped.
    pub async fn next(&mut self) -> Option<DiscoveryUpdate> {
        loop {
            let snapshot = self.subscription.next().await?;
            if !snapshot.exists() {
                return Some(DiscoveryUpdate::Ended);
            }
            if let Some(record) = snapshot.decode::<DiscoveryRecord>() {
                return Some(DiscoveryUpdate::Live(record));
            }
        }
    }

    /// Underlying subscription, for `unsubscribe`.
    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription.id()
    }
}

/// Read `viewer_count` out of a raw discovery document.
fn viewer_count_of(value: &Value) -> u32 {
    value
        .get("viewer_count")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

/// Copy of `record` with `viewer_count` adjusted by `delta`, clamped at 0.
/// Absent or non-object documents abort the transaction.
fn adjust_viewer_count(record: Option<&Value>, delta: i64) -> Option<Value> {
    let record = record.filter(|v| v.is_object())?;
    let next = i64::from(viewer_count_of(record))
        .saturating_add(delta)
        .max(0);
    let mut updated = record.clone();
    if let Value::Object(fields) = &mut updated {
        fields.insert("viewer_count".to_string(), json!(next));
    }
    Some(updated)
}

fn index_ids(index: Option<&Value>) -> Vec<String> {
    index
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Coordinates sessions through the shared store. Cheap to clone.
#[derive(Clone)]
pub struct SessionCoordinator {
    store: SharedStore,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Log a store failure for `operation` and convert it.
    fn store_failed(operation: &'static str, session_id: &SessionId, err: StoreError) -> PulseError {
        warn!(
            target: "pulse.session",
            session_id = %session_id,
            operation = operation,
            error = %err,
            "Session write failed"
        );
        metrics::record_store_error(operation);
        PulseError::Store(err)
    }

    /// Create a session owned by `host_id`. It starts out not broadcasting.
    ///
    /// # Errors
    ///
    /// Store failures.
    #[instrument(skip_all, fields(host_id = %host_id))]
    pub async fn create_session(
        &self,
        host_id: &UserId,
        host_name: &str,
        session_name: &str,
    ) -> Result<Session, PulseError> {
        let session = Session {
            session_id: SessionId::generate(),
            host_id: host_id.clone(),
            host_name: host_name.to_string(),
            session_name: session_name.to_string(),
            member_ids: BTreeSet::from([host_id.clone()]),
            is_active: true,
            is_broadcasting: false,
            viewer_count: 0,
            created_at: Utc::now(),
        };

        self.store
            .set(
                &StorePath::session(&session.session_id),
                serde_json::to_value(&session)?,
            )
            .await
            .map_err(|e| Self::store_failed("session_create", &session.session_id, e))?;

        info!(
            target: "pulse.session",
            session_id = %session.session_id,
            host_id = %host_id,
            "Session created"
        );
        Ok(session)
    }

    /// Fetch a session.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if absent or malformed; store failures.
    pub async fn get_session(&self, session_id: &SessionId) -> Result<Session, PulseError> {
        let snapshot = self.store.get(&StorePath::session(session_id)).await?;
        snapshot
            .decode::<Session>()
            .ok_or_else(|| PulseError::SessionNotFound(session_id.to_string()))
    }

    /// Fetch the discovery record of a live broadcast.
    ///
    /// # Errors
    ///
    /// `NotBroadcasting` if there is no record; store failures.
    pub async fn get_discovery(&self, session_id: &SessionId) -> Result<DiscoveryRecord, PulseError> {
        let snapshot = self.store.get(&StorePath::discovery(session_id)).await?;
        snapshot
            .decode::<DiscoveryRecord>()
            .ok_or_else(|| PulseError::NotBroadcasting(session_id.to_string()))
    }

    async fn owned_session(
        &self,
        session_id: &SessionId,
        host_id: &UserId,
    ) -> Result<Session, PulseError> {
        let session = self.get_session(session_id).await?;
        ensure_host(&session, host_id)?;
        Ok(session)
    }

    /// Delete a session and its discovery copy. Host only.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for non-hosts, `SessionNotFound`, store failures.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn delete_session(
        &self,
        session_id: &SessionId,
        host_id: &UserId,
    ) -> Result<(), PulseError> {
        self.owned_session(session_id, host_id).await?;
        // Also clears an orphaned record left by an interrupted stop.
        self.remove_discovery(session_id).await?;
        self.store
            .delete(&StorePath::session(session_id))
            .await
            .map_err(|e| Self::store_failed("session_delete", session_id, e))?;

        info!(target: "pulse.session", session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Add a member. Host only.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for non-hosts, `SessionNotFound`, store failures.
    #[instrument(skip_all, fields(session_id = %session_id, member_id = %member_id))]
    pub async fn add_member(
        &self,
        session_id: &SessionId,
        host_id: &UserId,
        member_id: &UserId,
    ) -> Result<Session, PulseError> {
        let mut session = self.owned_session(session_id, host_id).await?;
        if session.member_ids.insert(member_id.clone()) {
            self.write_members(&session).await?;
        }
        Ok(session)
    }

    /// Remove a member. Host only; the host cannot remove itself.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for non-hosts or removing the host,
    /// `SessionNotFound`, store failures.
    #[instrument(skip_all, fields(session_id = %session_id, member_id = %member_id))]
    pub async fn remove_member(
        &self,
        session_id: &SessionId,
        host_id: &UserId,
        member_id: &UserId,
    ) -> Result<Session, PulseError> {
        let mut session = self.owned_session(session_id, host_id).await?;
        if member_id == &session.host_id {
            return Err(PulseError::PermissionDenied(
                "host cannot be removed from its own session".to_string(),
            ));
        }
        if session.member_ids.remove(member_id) {
            self.write_members(&session).await?;
        }
        Ok(session)
    }

    async fn write_members(&self, session: &Session) -> Result<(), PulseError> {
        let mut fields = Map::new();
        fields.insert(
            "member_ids".to_string(),
            serde_json::to_value(&session.member_ids)?,
        );
        self.store
            .update(&StorePath::session(&session.session_id), fields)
            .await
            .map_err(|e| Self::store_failed("session_members", &session.session_id, e))
    }

    /// Start broadcasting: flag the session, then publish a discovery record
    /// with `viewer_count = 0` and list it in the discovery index.
    ///
    /// The writes are independent. If a later one fails the earlier ones stay
    /// applied and the pair is inconsistent until the next start/stop.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for non-hosts, store failures.
    #[instrument(skip_all, fields(session_id = %session.session_id))]
    pub async fn start_broadcast(
        &self,
        session: &Session,
        host_id: &UserId,
    ) -> Result<DiscoveryRecord, PulseError> {
        ensure_host(session, host_id)?;
        let session_id = &session.session_id;

        let mut fields = Map::new();
        fields.insert("is_broadcasting".to_string(), json!(true));
        fields.insert("is_active".to_string(), json!(true));
        fields.insert("viewer_count".to_string(), json!(0));
        self.store
            .update(&StorePath::session(session_id), fields)
            .await
            .map_err(|e| Self::store_failed("broadcast_flag", session_id, e))?;

        let record = DiscoveryRecord {
            session_id: session_id.clone(),
            host_id: host_id.clone(),
            host_name: session.host_name.clone(),
            session_name: session.session_name.clone(),
            started_at: Utc::now(),
            viewer_count: 0,
        };
        self.store
            .set(
                &StorePath::discovery(session_id),
                serde_json::to_value(&record)?,
            )
            .await
            .map_err(|e| Self::store_failed("discovery_set", session_id, e))?;

        let id = session_id.to_string();
        self.store
            .transact(&StorePath::discovery_index(), &move |index| {
                let mut ids = index_ids(index);
                if ids.contains(&id) {
                    return None;
                }
                ids.push(id.clone());
                Some(json!(ids))
            })
            .await
            .map_err(|e| Self::store_failed("discovery_index_add", session_id, e))?;

        info!(
            target: "pulse.session",
            session_id = %session_id,
            host_id = %host_id,
            "Broadcast started"
        );
        Ok(record)
    }

    /// Stop broadcasting: clear the flag and remove the discovery record
    /// (which also resets the viewer count).
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for non-hosts, store failures.
    #[instrument(skip_all, fields(session_id = %session.session_id))]
    pub async fn stop_broadcast(&self, session: &Session, host_id: &UserId) -> Result<(), PulseError> {
        ensure_host(session, host_id)?;
        let session_id = &session.session_id;

        let mut fields = Map::new();
        fields.insert("is_broadcasting".to_string(), json!(false));
        fields.insert("viewer_count".to_string(), json!(0));
        self.store
            .update(&StorePath::session(session_id), fields)
            .await
            .map_err(|e| Self::store_failed("broadcast_flag", session_id, e))?;

        self.remove_discovery(session_id).await?;

        info!(
            target: "pulse.session",
            session_id = %session_id,
            "Broadcast stopped"
        );
        Ok(())
    }

    async fn remove_discovery(&self, session_id: &SessionId) -> Result<(), PulseError> {
        self.store
            .delete(&StorePath::discovery(session_id))
            .await
            .map_err(|e| Self::store_failed("discovery_delete", session_id, e))?;

        let id = session_id.to_string();
        self.store
            .transact(&StorePath::discovery_index(), &move |index| {
                let ids = index_ids(index);
                if !ids.contains(&id) {
                    return None;
                }
                let remaining: Vec<String> = ids.into_iter().filter(|s| s != &id).collect();
                Some(json!(remaining))
            })
            .await
            .map_err(|e| Self::store_failed("discovery_index_remove", session_id, e))?;
        Ok(())
    }

    /// Register as a viewer and atomically increment the viewer count.
    ///
    /// Returns the committed count.
    ///
    /// # Errors
    ///
    /// `NotBroadcasting` if there is no discovery record (the registration
    /// is withdrawn again), store failures.
    #[instrument(skip_all, fields(session_id = %session_id, viewer_id = %viewer_id))]
    pub async fn join_as_viewer(
        &self,
        session_id: &SessionId,
        viewer_id: &UserId,
    ) -> Result<u32, PulseError> {
        let registration_path = StorePath::viewer_registration(session_id, viewer_id);
        let registration = ViewerRegistration {
            session_id: session_id.clone(),
            viewer_id: viewer_id.clone(),
            registered_at: Utc::now(),
        };
        self.store
            .set(&registration_path, serde_json::to_value(&registration)?)
            .await
            .map_err(|e| Self::store_failed("viewer_register", session_id, e))?;

        let committed = match self
            .store
            .transact(&StorePath::discovery(session_id), &|record| {
                adjust_viewer_count(record, 1)
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::record_viewer_transaction("join", "error");
                return Err(Self::store_failed("viewer_increment", session_id, e));
            }
        };

        let Some(count) = committed.value.as_ref().map(viewer_count_of) else {
            metrics::record_viewer_transaction("join", "absent");
            // Best effort: the registration is meaningless without a broadcast.
            if let Err(e) = self.store.delete(&registration_path).await {
                debug!(
                    target: "pulse.session",
                    session_id = %session_id,
                    error = %e,
                    "Failed to withdraw registration"
                );
            }
            return Err(PulseError::NotBroadcasting(session_id.to_string()));
        };

        metrics::record_viewer_transaction("join", "success");
        info!(
            target: "pulse.session",
            session_id = %session_id,
            viewer_id = %viewer_id,
            viewer_count = count,
            "Viewer joined"
        );
        Ok(count)
    }

    /// Withdraw the registration and atomically decrement the viewer count,
    /// clamped at 0.
    ///
    /// Returns the committed count (0 when the broadcast already ended).
    ///
    /// # Errors
    ///
    /// Store failures. A failed decrement is not retried and leaves the
    /// count one too high.
    #[instrument(skip_all, fields(session_id = %session_id, viewer_id = %viewer_id))]
    pub async fn leave_as_viewer(
        &self,
        session_id: &SessionId,
        viewer_id: &UserId,
    ) -> Result<u32, PulseError> {
        self.store
            .delete(&StorePath::viewer_registration(session_id, viewer_id))
            .await
            .map_err(|e| Self::store_failed("viewer_unregister", session_id, e))?;

        let committed = match self
            .store
            .transact(&StorePath::discovery(session_id), &|record| {
                adjust_viewer_count(record, -1)
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::record_viewer_transaction("leave", "error");
                return Err(Self::store_failed("viewer_decrement", session_id, e));
            }
        };

        let count = committed.value.as_ref().map_or(0, viewer_count_of);
        metrics::record_viewer_transaction(
            "leave",
            if committed.exists() { "success" } else { "absent" },
        );
        info!(
            target: "pulse.session",
            session_id = %session_id,
            viewer_id = %viewer_id,
            viewer_count = count,
            "Viewer left"
        );
        Ok(count)
    }

    /// All sessions currently listed for discovery. Index entries whose
    /// record is missing or malformed are skipped.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_discoverable(&self) -> Result<Vec<DiscoveryRecord>, PulseError> {
        let index = self.store.get(&StorePath::discovery_index()).await?;
        let mut records = Vec::new();
        for id in index_ids(index.value.as_ref()) {
            let Ok(session_id) = SessionId::new(id) else {
                continue;
            };
            let snapshot = self.store.get(&StorePath::discovery(&session_id)).await?;
            if let Some(record) = snapshot.decode::<DiscoveryRecord>() {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Follow a session's discovery record (live viewer count, end of
    /// broadcast).
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn watch_discovery(&self, session_id: &SessionId) -> Result<DiscoveryWatch, PulseError> {
        let subscription = self.store.subscribe(&StorePath::discovery(session_id)).await?;
        Ok(DiscoveryWatch { subscription })
    }

    /// Stop a watch started with [`SessionCoordinator::watch_discovery`].
    pub fn unwatch(&self, watch: &DiscoveryWatch) {
        self.store.unsubscribe(watch.subscription_id());
    }

    /// Compare the session flag with the discovery record. Reports only;
    /// nothing is repaired.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, store failures.
    pub async fn check_broadcast_consistency(
        &self,
        session_id: &SessionId,
    ) -> Result<BroadcastConsistency, PulseError> {
        let session = self.get_session(session_id).await?;
        let record: Snapshot = self.store.get(&StorePath::discovery(session_id)).await?;

        let consistency = match (session.is_broadcasting, record.exists()) {
            (true, true) | (false, false) => BroadcastConsistency::Consistent,
            (true, false) => BroadcastConsistency::MissingDiscovery,
            (false, true) => BroadcastConsistency::OrphanedDiscovery,
        };
        if consistency != BroadcastConsistency::Consistent {
            warn!(
                target: "pulse.session",
                session_id = %session_id,
                consistency = ?consistency,
                "Broadcast flag and discovery record disagree"
            );
        }
        Ok(consistency)
    }
}

fn ensure_host(session: &Session, host_id: &UserId) -> Result<(), PulseError> {
    if &session.host_id == host_id {
        Ok(())
    } else {
        Err(PulseError::PermissionDenied(format!(
            "{host_id} is not the host of session {}",
            session.session_id
        )))
    }
}
