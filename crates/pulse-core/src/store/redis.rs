//! Redis-backed store.
//!
//! Documents are stored as JSON strings under their [`StorePath`] key.
//! Every write also publishes the new value on `pulse:changes:{key}` so
//! subscribers see changes without polling (`null` payload = deleted).
//!
//! # Connection Pattern
//!
//! Plain reads and writes share one `MultiplexedConnection`, which is cheap
//! to clone and safe to use concurrently. `transact` opens its own
//! connection because `WATCH` state is per connection and must not be shared
//! with unrelated commands.
//!
//! # Transactions
//!
//! `transact` runs `WATCH key; GET key; MULTI; SET; PUBLISH; EXEC`. A
//! concurrent write to the key aborts `EXEC` and the attempt is retried
//! against the newly committed value.

use super::{
    merge_fields, RemoteStore, Snapshot, StoreError, StorePath, Subscription, SubscriptionId,
    TransactFn, TRANSACT_BACKOFF_BASE, TRANSACT_BACKOFF_MAX,
};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Channel prefix for change notifications.
const CHANGE_CHANNEL_PREFIX: &str = "pulse:changes:";

fn change_channel(path: &StorePath) -> String {
    format!("{CHANGE_CHANNEL_PREFIX}{path}")
}

fn encode(value: Option<&Value>) -> Result<String, StoreError> {
    match value {
        Some(v) => serde_json::to_string(v).map_err(|e| StoreError::Codec(e.to_string())),
        None => Ok("null".to_string()),
    }
}

fn decode(path: &StorePath, raw: Option<String>) -> Result<Option<Value>, StoreError> {
    match raw {
        None => Ok(None),
        Some(json) => serde_json::from_str::<Value>(&json)
            .map(|v| if v.is_null() { None } else { Some(v) })
            .map_err(|e| {
                warn!(
                    target: "pulse.store.redis",
                    error = %e,
                    path = %path,
                    "Stored document is not valid JSON"
                );
                StoreError::Codec(format!("{path}: {e}"))
            }),
    }
}

/// Redis implementation of [`RemoteStore`].
///
/// Cheaply cloneable; clones share the connection and subscription table.
#[derive(Clone)]
pub struct RedisStore {
    /// Client used to open transaction and pub/sub connections.
    client: Client,
    /// Shared connection for plain reads and writes.
    connection: MultiplexedConnection,
    /// Cancellation tokens of running subscription listeners.
    subscriptions: Arc<Mutex<HashMap<SubscriptionId, CancellationToken>>>,
    next_subscription: Arc<AtomicU64>,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the URL is invalid or the
    /// connection cannot be established.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may carry credentials
            error!(
                target: "pulse.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            StoreError::Unavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "pulse.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                StoreError::Unavailable(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(0)),
        })
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, CancellationToken>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn write_and_publish(&self, path: &StorePath, value: Option<&Value>) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let payload = encode(value)?;
        let channel = change_channel(path);

        let mut pipe = redis::pipe();
        pipe.atomic();
        match value {
            Some(_) => pipe.set(path.as_str(), &payload).ignore(),
            None => pipe.del(path.as_str()).ignore(),
        };
        pipe.publish(&channel, &payload).ignore();

        let _: () = pipe.query_async(&mut conn).await.map_err(|e| {
            warn!(
                target: "pulse.store.redis",
                error = %e,
                path = %path,
                "Failed to write document"
            );
            StoreError::Unavailable(format!("Failed to write {path}: {e}"))
        })?;

        Ok(())
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    #[instrument(skip_all, fields(path = %path))]
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError> {
        let mut conn = self.connection.clone();

        let raw: Option<String> = conn.get(path.as_str()).await.map_err(|e| {
            warn!(
                target: "pulse.store.redis",
                error = %e,
                path = %path,
                "Failed to read document"
            );
            StoreError::Unavailable(format!("Failed to read {path}: {e}"))
        })?;

        Ok(Snapshot::new(path.clone(), decode(path, raw)?))
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn set(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.write_and_publish(path, Some(&value)).await
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<(), StoreError> {
        let apply = move |current: Option<&Value>| Some(merge_fields(current, &fields));
        self.transact(path, &apply).await.map(|_| ())
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn delete(&self, path: &StorePath) -> Result<(), StoreError> {
        self.write_and_publish(path, None).await
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn transact(&self, path: &StorePath, apply: &TransactFn) -> Result<Snapshot, StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open transaction connection: {e}")))?;
        let key = path.as_str();
        let channel = change_channel(path);
        let mut delay = TRANSACT_BACKOFF_BASE;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let _: () = redis::cmd("WATCH")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(format!("WATCH {path} failed: {e}")))?;

            let raw: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| StoreError::Unavailable(format!("GET {path} failed: {e}")))?;
            let current = decode(path, raw)?;

            let Some(next) = apply(current.as_ref()) else {
                let _: () = redis::cmd("UNWATCH")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("UNWATCH failed: {e}")))?;
                return Ok(Snapshot::new(path.clone(), current));
            };
            let payload = encode(Some(&next))?;

            // EXEC returns nil when the watched key changed underneath us.
            let committed: Option<(String,)> = redis::pipe()
                .atomic()
                .set(key, &payload)
                .ignore()
                .publish(&channel, &payload)
                .ignore()
                .get(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(format!("EXEC {path} failed: {e}")))?;

            if committed.is_some() {
                debug!(
                    target: "pulse.store.redis",
                    path = %path,
                    attempt = attempt,
                    "Transaction committed"
                );
                return Ok(Snapshot::new(path.clone(), Some(next)));
            }

            debug!(
                target: "pulse.store.redis",
                path = %path,
                attempt = attempt,
                delay_ms = delay.as_millis(),
                "Transaction conflicted, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(TRANSACT_BACKOFF_MAX);
        }
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open pub/sub connection: {e}")))?;

        // Subscribe before reading so no change between the two is missed.
        pubsub
            .subscribe(change_channel(path))
            .await
            .map_err(|e| StoreError::Unavailable(format!("SUBSCRIBE {path} failed: {e}")))?;

        let current = self.get(path).await?;

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1);
        let cancel_token = CancellationToken::new();
        self.subscriptions().insert(id, cancel_token.clone());

        let (sender, receiver) = mpsc::unbounded_channel();
        // Receiver is alive: we still hold it.
        let _ = sender.send(current);

        let listener_path = path.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!(
                                target: "pulse.store.redis",
                                path = %listener_path,
                                "Pub/sub connection closed"
                            );
                            break;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                debug!(
                                    target: "pulse.store.redis",
                                    path = %listener_path,
                                    error = %e,
                                    "Ignoring undecodable change payload"
                                );
                                continue;
                            }
                        };
                        let value = match decode(&listener_path, Some(payload)) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if sender.send(Snapshot::new(listener_path.clone(), value)).is_err() {
                            break;
                        }
                    }
                }
            }
            subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });

        Ok(Subscription::new(id, path.clone(), receiver))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(token) = self.subscriptions().remove(&id) {
            token.cancel();
        }
    }
}
