//! Durable keyed storage.
//!
//! Every piece of shared state (user quotas, the budget counter, conversation
//! handles) goes through a [`Store`]. The trait exposes two concurrency
//! primitives that the rest of the crate relies on:
//!
//! - [`Store::transact`]: keyed read-modify-write. The closure may be re-run on
//!   conflict, so it must be a pure function of the current value.
//! - [`Store::append_and_increment`]: appends a ledger entry and bumps a counter
//!   as one atomic operation, never as read-then-write.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis_backend;

pub use memory::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use redis_backend::{RedisStore, RedisStoreConfig};

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transient store failure: {message}")]
    Transient { message: String },

    #[error("Transaction on {key} kept conflicting after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Logical record addresses. Backends prefix [`StoreKey::path`] as they see fit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Quota(String),
    /// Running cost counter for a billing period, in micro-dollars.
    Budget(String),
    Ledger(String),
    Thread(String),
    History(String),
    /// Aggregate tokens consumed on a local calendar day.
    DailyTokens(String),
    PurgeQueue,
}

impl StoreKey {
    pub fn path(&self) -> String {
        match self {
            Self::Quota(user) => format!("quota:{}", user),
            Self::Budget(period) => format!("budget:{}", period),
            Self::Ledger(period) => format!("ledger:{}", period),
            Self::Thread(user) => format!("thread:{}", user),
            Self::History(user) => format!("history:{}", user),
            Self::DailyTokens(day) => format!("tokens:{}", day),
            Self::PurgeQueue => "purge".to_string(),
        }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// Result of one transaction attempt: what to write back (if anything) and
/// what to hand back to the caller.
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    pub write: Option<Value>,
    pub output: Value,
}

pub type TxnFn<'a> = dyn Fn(Option<Value>) -> StoreResult<TxnOutcome> + Send + Sync + 'a;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &StoreKey) -> StoreResult<Option<Value>>;

    /// Keyed read-modify-write. Writes for the same key serialize; the closure
    /// observes the latest committed value.
    async fn transact(&self, key: &StoreKey, txn: &TxnFn<'_>) -> StoreResult<Value>;

    /// Appends `entry` to `list` and adds `delta` to `counter` atomically.
    /// Returns the counter value after the increment.
    async fn append_and_increment(
        &self,
        list: &StoreKey,
        entry: Value,
        counter: &StoreKey,
        delta: i64,
    ) -> StoreResult<i64>;

    async fn increment(&self, counter: &StoreKey, delta: i64) -> StoreResult<i64>;

    async fn counter(&self, key: &StoreKey) -> StoreResult<i64>;

    /// Appends to a list, keeping at most `max_len` newest entries when set.
    async fn append(
        &self,
        list: &StoreKey,
        entry: Value,
        max_len: Option<usize>,
    ) -> StoreResult<()>;

    async fn list(&self, key: &StoreKey) -> StoreResult<Vec<Value>>;

    /// Removes and returns up to `count` entries from the head of a list.
    async fn take_front(&self, list: &StoreKey, count: usize) -> StoreResult<Vec<Value>>;

    async fn delete(&self, key: &StoreKey) -> StoreResult<bool>;
}

impl dyn Store {
    pub async fn load<T: DeserializeOwned>(&self, key: &StoreKey) -> StoreResult<Option<T>> {
        self.get(key)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }

    /// Typed [`Store::transact`]. `f` receives the current record and returns
    /// the record to write (`None` leaves it untouched) plus the caller's result.
    pub async fn update<T, R, F>(&self, key: &StoreKey, f: F) -> StoreResult<R>
    where
        T: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        F: Fn(Option<T>) -> (Option<T>, R) + Send + Sync,
    {
        let txn = move |current: Option<Value>| -> StoreResult<TxnOutcome> {
            let current = current.map(serde_json::from_value::<T>).transpose()?;
            let (next, output) = f(current);
            Ok(TxnOutcome {
                write: next.map(serde_json::to_value).transpose()?,
                output: serde_json::to_value(output)?,
            })
        };
        let output = self.transact(key, &txn).await?;
        Ok(serde_json::from_value(output)?)
    }

    pub async fn load_list<T: DeserializeOwned>(&self, key: &StoreKey) -> StoreResult<Vec<T>> {
        self.list(key)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub key_prefix: String,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "gate:".to_string(),
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

pub(crate) async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < policy.max_retries && e.is_transient() => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying store operation after transient failure"
                );
                // Symmetrical 10% jitter
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a backend with bounded, jittered retries on transient failures.
///
/// `append_and_increment`, `increment` and `take_front` are passed through
/// without retry: a failure reported after the backend committed would
/// otherwise double count or drop entries.
///
/// `transact` is retried, so a closure may run again after a lost commit
/// acknowledgement. Transactions must tolerate seeing their own write.
pub struct RetryingStore {
    inner: Arc<dyn Store>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait::async_trait]
impl Store for RetryingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &StoreKey) -> StoreResult<Option<Value>> {
        with_retry(self.policy, || self.inner.get(key)).await
    }

    async fn transact(&self, key: &StoreKey, txn: &TxnFn<'_>) -> StoreResult<Value> {
        with_retry(self.policy, || self.inner.transact(key, txn)).await
    }

    async fn append_and_increment(
        &self,
        list: &StoreKey,
        entry: Value,
        counter: &StoreKey,
        delta: i64,
    ) -> StoreResult<i64> {
        self.inner
            .append_and_increment(list, entry, counter, delta)
            .await
    }

    async fn increment(&self, counter: &StoreKey, delta: i64) -> StoreResult<i64> {
        self.inner.increment(counter, delta).await
    }

    async fn counter(&self, key: &StoreKey) -> StoreResult<i64> {
        with_retry(self.policy, || self.inner.counter(key)).await
    }

    async fn append(
        &self,
        list: &StoreKey,
        entry: Value,
        max_len: Option<usize>,
    ) -> StoreResult<()> {
        with_retry(self.policy, || self.inner.append(list, entry.clone(), max_len)).await
    }

    async fn list(&self, key: &StoreKey) -> StoreResult<Vec<Value>> {
        with_retry(self.policy, || self.inner.list(key)).await
    }

    async fn take_front(&self, list: &StoreKey, count: usize) -> StoreResult<Vec<Value>> {
        self.inner.take_front(list, count).await
    }

    async fn delete(&self, key: &StoreKey) -> StoreResult<bool> {
        with_retry(self.policy, || self.inner.delete(key)).await
    }
}
