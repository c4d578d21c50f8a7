//! In-process store.
//!
//! Holds every document in one map behind a mutex. `transact` is optimistic:
//! it reads a document version, yields to the scheduler, computes the
//! successor outside the lock, and commits only if the version is unchanged.
//! Concurrent transactions on the same path therefore genuinely conflict. A
//! conflicted transaction re-runs its closure with the lock held, so every
//! `transact` commits after at most one retry.
//!
//! Used for single-process deployments and as the reference store in tests.

use super::{
    merge_fields, RemoteStore, Snapshot, StoreError, StorePath, Subscription, SubscriptionId,
    TransactFn,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// In-memory [`RemoteStore`].
///
/// Cheaply cloneable; clones share the same documents and subscribers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<StorePath, Value>,
    /// Write counter per path. Survives deletes so a delete also conflicts.
    versions: HashMap<StorePath, u64>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    next_subscription: u64,
}

#[derive(Debug)]
struct Subscriber {
    path: StorePath,
    sender: mpsc::UnboundedSender<Snapshot>,
}

impl Inner {
    fn version(&self, path: &StorePath) -> u64 {
        self.versions.get(path).copied().unwrap_or(0)
    }

    fn write(&mut self, path: &StorePath, value: Option<Value>) {
        match &value {
            Some(v) => {
                self.docs.insert(path.clone(), v.clone());
            }
            None => {
                self.docs.remove(path);
            }
        }
        *self.versions.entry(path.clone()).or_insert(0) += 1;
        self.notify(path, value);
    }

    fn notify(&mut self, path: &StorePath, value: Option<Value>) {
        let snapshot = Snapshot::new(path.clone(), value);
        self.subscribers.retain(|_, sub| {
            if &sub.path != path {
                return true;
            }
            // Receiver dropped without unsubscribe: forget it.
            sub.sender.send(snapshot.clone()).is_ok()
        });
    }
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live subscriptions (all paths).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.lock().docs.len()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError> {
        let inner = self.lock();
        Ok(Snapshot::new(path.clone(), inner.docs.get(path).cloned()))
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.lock().write(path, Some(value));
        Ok(())
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let merged = merge_fields(inner.docs.get(path), &fields);
        inner.write(path, Some(merged));
        Ok(())
    }

    async fn delete(&self, path: &StorePath) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.docs.contains_key(path) {
            inner.write(path, None);
        }
        Ok(())
    }

    async fn transact(&self, path: &StorePath, apply: &TransactFn) -> Result<Snapshot, StoreError> {
        let (current, version) = {
            let inner = self.lock();
            (inner.docs.get(path).cloned(), inner.version(path))
        };

        // Let competing writers interleave between read and commit.
        tokio::task::yield_now().await;

        let Some(next) = apply(current.as_ref()) else {
            return Ok(Snapshot::new(path.clone(), current));
        };

        let mut inner = self.lock();
        if inner.version(path) == version {
            inner.write(path, Some(next.clone()));
            return Ok(Snapshot::new(path.clone(), Some(next)));
        }

        debug!(
            target: "pulse.store.memory",
            path = %path,
            "Transaction conflicted, retrying under lock"
        );

        // Nothing can interleave while the lock is held, so this commits.
        let current = inner.docs.get(path).cloned();
        match apply(current.as_ref()) {
            Some(next) => {
                inner.write(path, Some(next.clone()));
                Ok(Snapshot::new(path.clone(), Some(next)))
            }
            None => Ok(Snapshot::new(path.clone(), current)),
        }
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);

        // Deliver the current value before any later change; both happen
        // under the same lock so no write can slip in between.
        let current = Snapshot::new(path.clone(), inner.docs.get(path).cloned());
        if sender.send(current).is_ok() {
            inner.subscribers.insert(
                id,
                Subscriber {
                    path: path.clone(),
                    sender,
                },
            );
        }

        Ok(Subscription::new(id, path.clone(), receiver))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.remove(&id);
    }
}
