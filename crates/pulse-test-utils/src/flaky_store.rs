//! `RemoteStore` wrapper with failure injection.
//!
//! Wraps any store and fails selected operations with
//! `StoreError::Unavailable`, or delays reads, so tests can exercise the
//! "swallow and retry on the next tick" paths and late completions.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = FlakyStore::new(Arc::new(InMemoryStore::new()));
//! store.fail_next(StoreOp::Get, 2);
//! store.set_get_delay(Duration::from_secs(5));
//! ```

use async_trait::async_trait;
use pulse_core::store::{
    RemoteStore, SharedStore, Snapshot, StoreError, StorePath, Subscription, SubscriptionId,
    TransactFn,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Store operation kinds that can be failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Set,
    Update,
    Delete,
    Transact,
    Subscribe,
}

#[derive(Debug, Default)]
struct FlakyState {
    /// Remaining forced failures per operation.
    fail_next: HashMap<StoreOp, usize>,
    /// Operations that always fail.
    fail_always: HashMap<StoreOp, bool>,
    /// Calls seen per operation (including failed ones).
    calls: HashMap<StoreOp, usize>,
    get_delay: Duration,
}

/// Fault-injecting store wrapper. Clones share the same fault settings.
#[derive(Clone)]
pub struct FlakyStore {
    inner: SharedStore,
    state: Arc<Mutex<FlakyState>>,
}

impl FlakyStore {
    /// Wrap `inner` with no faults configured.
    #[must_use]
    pub fn new(inner: SharedStore) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(FlakyState::default())),
        }
    }

    /// Fail the next `count` calls of `op`.
    pub fn fail_next(&self, op: StoreOp, count: usize) {
        self.state.lock().unwrap().fail_next.insert(op, count);
    }

    /// Fail every call of `op` until switched off again.
    pub fn fail_always(&self, op: StoreOp, enabled: bool) {
        self.state.lock().unwrap().fail_always.insert(op, enabled);
    }

    /// Delay every `get` by `delay` before reading.
    pub fn set_get_delay(&self, delay: Duration) {
        self.state.lock().unwrap().get_delay = delay;
    }

    /// Number of calls of `op` so far.
    #[must_use]
    pub fn call_count(&self, op: StoreOp) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Record a call and decide whether it fails.
    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_insert(0) += 1;

        if state.fail_always.get(&op).copied().unwrap_or(false) {
            return Err(StoreError::Unavailable(format!("injected {op:?} failure")));
        }
        if let Some(remaining) = state.fail_next.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("injected {op:?} failure")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError> {
        let delay = self.state.lock().unwrap().get_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(StoreOp::Get)?;
        self.inner.get(path).await
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.check(StoreOp::Set)?;
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.check(StoreOp::Update)?;
        self.inner.update(path, fields).await
    }

    async fn delete(&self, path: &StorePath) -> Result<(), StoreError> {
        self.check(StoreOp::Delete)?;
        self.inner.delete(path).await
    }

    async fn transact(&self, path: &StorePath, apply: &TransactFn) -> Result<Snapshot, StoreError> {
        self.check(StoreOp::Transact)?;
        self.inner.transact(path, apply).await
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        self.check(StoreOp::Subscribe)?;
        self.inner.subscribe(path).await
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unsubscribe(id);
    }
}
