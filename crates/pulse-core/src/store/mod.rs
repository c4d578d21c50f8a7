//! Remote document store abstraction.
//!
//! Every component reads and writes shared state through [`RemoteStore`]:
//! a key-path document store with change subscriptions and an atomic
//! read-modify-write primitive. Documents are JSON values.
//!
//! # Key Patterns
//!
//! - `peer:{id}:status` - Peer liveness status (`PeerStatus`)
//! - `session:{id}` - Broadcast session owned by its host (`Session`)
//! - `session:{id}:viewers:{viewer}` - Viewer registration
//! - `discovery:{id}` - Public copy of a broadcasting session
//! - `discovery:index` - Session IDs currently listed for discovery
//! - `user:{id}:mode` - Authoritative announced mode for a user
//! - `user:{id}:heart_rate` - Latest reported heart rate
//!
//! # Ordering
//!
//! Updates on a single path arrive in store-applied order. There is no
//! ordering across paths: a `session:{id}` change and the matching
//! `discovery:{id}` change may be observed in either order.

pub mod memory;
pub mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use common::types::{PeerId, SessionId, UserId};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// First delay between conflicting `transact` attempts.
pub const TRANSACT_BACKOFF_BASE: Duration = Duration::from_millis(2);

/// Maximum delay between conflicting `transact` attempts.
pub const TRANSACT_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store could not be reached or the operation failed in transit.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Stored payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// Whether retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Typed key into the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(String);

impl StorePath {
    /// Liveness status reported by a peer.
    #[must_use]
    pub fn peer_status(peer_id: &PeerId) -> Self {
        Self(format!("peer:{peer_id}:status"))
    }

    /// Session document owned by the host.
    #[must_use]
    pub fn session(session_id: &SessionId) -> Self {
        Self(format!("session:{session_id}"))
    }

    /// A single viewer's registration in a session.
    #[must_use]
    pub fn viewer_registration(session_id: &SessionId, viewer_id: &UserId) -> Self {
        Self(format!("session:{session_id}:viewers:{viewer_id}"))
    }

    /// Public discovery copy of a broadcasting session.
    #[must_use]
    pub fn discovery(session_id: &SessionId) -> Self {
        Self(format!("discovery:{session_id}"))
    }

    /// List of session IDs currently published for discovery.
    #[must_use]
    pub fn discovery_index() -> Self {
        Self("discovery:index".to_string())
    }

    /// Authoritative mode announced by a user.
    #[must_use]
    pub fn user_mode(user_id: &UserId) -> Self {
        Self(format!("user:{user_id}:mode"))
    }

    /// Latest heart rate reported by a user.
    #[must_use]
    pub fn heart_rate(user_id: &UserId) -> Self {
        Self(format!("user:{user_id}:heart_rate"))
    }

    /// Borrow the raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time value of a path. `value` is `None` when the path is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: StorePath,
    pub value: Option<Value>,
}

impl Snapshot {
    #[must_use]
    pub fn new(path: StorePath, value: Option<Value>) -> Self {
        Self { path, value }
    }

    /// Whether the document exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// Decode the document.
    ///
    /// Missing and malformed payloads both yield `None`; callers treat that
    /// as "no update" and keep their previous state.
    #[must_use]
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        let value = self.value.as_ref()?;
        match serde_json::from_value(value.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::debug!(
                    target: "pulse.store",
                    path = %self.path,
                    error = %e,
                    "Ignoring malformed document"
                );
                None
            }
        }
    }
}

/// Identifier of a live subscription, used for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Stream of snapshots for one path.
///
/// The current value is delivered first, then one snapshot per change.
/// `next()` returns `None` once the subscription is cancelled.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    path: StorePath,
    receiver: mpsc::UnboundedReceiver<Snapshot>,
}

impl Subscription {
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        path: StorePath,
        receiver: mpsc::UnboundedReceiver<Snapshot>,
    ) -> Self {
        Self { id, path, receiver }
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Wait for the next snapshot.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.receiver.recv().await
    }
}

/// Read-modify-write function for [`RemoteStore::transact`].
///
/// Receives the latest committed value (`None` if absent) and returns the
/// successor, or `None` to abort without writing. May be invoked several
/// times when writers conflict, so it must be pure.
pub type TransactFn = dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync;

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn RemoteStore>;

/// Key-path document store with change notification and atomic transactions.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One-shot read.
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError>;

    /// Replace the document at `path`.
    async fn set(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    /// Merge top-level fields into the document, creating it if absent.
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Remove the document. Deleting an absent path succeeds.
    async fn delete(&self, path: &StorePath) -> Result<(), StoreError>;

    /// Atomically apply `apply` against the latest committed value,
    /// retrying internally on conflicting writers until it commits. Only
    /// transport failures end a transaction early. Returns the committed
    /// value (the unchanged current value when `apply` aborted).
    async fn transact(&self, path: &StorePath, apply: &TransactFn) -> Result<Snapshot, StoreError>;

    /// Follow a path: current value first, then every change.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError>;

    /// Cancel a subscription. Unknown or already-cancelled IDs are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Merge `fields` into `base`, replacing non-object bases.
pub(crate) fn merge_fields(base: Option<&Value>, fields: &Map<String, Value>) -> Value {
    let mut merged = match base {
        Some(Value::Object(existing)) => existing.clone(),
        _ => Map::new(),
    };
    for (key, value) in fields {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}
