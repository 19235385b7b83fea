//! Redis store backend.
//!
//! Keyed transactions use optimistic concurrency (WATCH / MULTI / EXEC) and are
//! retried on conflict; ledger appends and counter bumps go out as one atomic
//! pipeline.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use serde_json::Value;

use super::{Store, StoreConfig, StoreError, StoreKey, StoreResult, TxnFn};

#[derive(Clone, Debug)]
pub struct RedisStoreConfig {
    pub key_prefix: String,
    pub connection_timeout: Duration,
    /// WATCH conflicts tolerated before giving up with [`StoreError::Conflict`].
    pub max_txn_attempts: u32,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "gate:".to_string(),
            connection_timeout: Duration::from_secs(5),
            max_txn_attempts: 8,
        }
    }
}

impl RedisStoreConfig {
    /// Takes the key prefix from the gateway's store section.
    pub fn from_store_config(config: &StoreConfig) -> StoreResult<Self> {
        Self::default().prefix(config.key_prefix.clone())
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }
}

pub struct RedisStore {
    client: Arc<redis::Client>,
    config: RedisStoreConfig,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisStoreConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisStoreConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    fn key(&self, key: &StoreKey) -> String {
        format!("{}{}", self.config.key_prefix, key.path())
    }

    // WATCH state is per connection, so every operation gets its own.
    async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Transient {
            message: "connection timeout".into(),
        })?
        .map_err(map_redis_error)
    }
}

fn map_redis_error(error: redis::RedisError) -> StoreError {
    if error.is_io_error() || error.is_timeout() {
        StoreError::Transient {
            message: error.to_string(),
        }
    } else {
        StoreError::Storage {
            message: error.to_string(),
        }
    }
}

fn decode(raw: Option<String>) -> StoreResult<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)
}

#[async_trait::async_trait]
impl Store for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &StoreKey) -> StoreResult<Option<Value>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.key(key)).await.map_err(map_redis_error)?;
        decode(raw)
    }

    async fn transact(&self, key: &StoreKey, txn: &TxnFn<'_>) -> StoreResult<Value> {
        let mut conn = self.connection().await?;
        let path = self.key(key);

        for attempt in 1..=self.config.max_txn_attempts {
            redis::cmd("WATCH")
                .arg(&path)
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_redis_error)?;

            let raw: Option<String> = conn.get(&path).await.map_err(map_redis_error)?;
            let outcome = match decode(raw).and_then(|current| txn(current)) {
                Ok(outcome) => outcome,
                Err(e) => {
                    redis::cmd("UNWATCH")
                        .query_async::<()>(&mut conn)
                        .await
                        .map_err(map_redis_error)?;
                    return Err(e);
                }
            };

            let Some(value) = outcome.write else {
                redis::cmd("UNWATCH")
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                return Ok(outcome.output);
            };

            let data = serde_json::to_string(&value)?;
            let committed: Option<()> = redis::pipe()
                .atomic()
                .set(&path, data)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            if committed.is_some() {
                return Ok(outcome.output);
            }
            tracing::debug!(key = %path, attempt, "Redis transaction aborted by concurrent write");
        }

        Err(StoreError::Conflict {
            key: path,
            attempts: self.config.max_txn_attempts,
        })
    }

    async fn append_and_increment(
        &self,
        list: &StoreKey,
        entry: Value,
        counter: &StoreKey,
        delta: i64,
    ) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let data = serde_json::to_string(&entry)?;

        // Atomic: ledger append + counter bump in MULTI/EXEC
        let (total,): (i64,) = redis::pipe()
            .atomic()
            .rpush(self.key(list), data)
            .ignore()
            .incr(self.key(counter), delta)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(total)
    }

    async fn increment(&self, counter: &StoreKey, delta: i64) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        conn.incr(self.key(counter), delta)
            .await
            .map_err(map_redis_error)
    }

    async fn counter(&self, key: &StoreKey) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = conn.get(self.key(key)).await.map_err(map_redis_error)?;
        Ok(value.unwrap_or(0))
    }

    async fn append(
        &self,
        list: &StoreKey,
        entry: Value,
        max_len: Option<usize>,
    ) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let path = self.key(list);
        let data = serde_json::to_string(&entry)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.rpush(&path, data).ignore();
        if let Some(max) = max_len {
            pipe.ltrim(&path, -(max as isize), -1).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn list(&self, key: &StoreKey) -> StoreResult<Vec<Value>> {
        let mut conn = self.connection().await?;
        let items: Vec<String> = conn
            .lrange(self.key(key), 0, -1)
            .await
            .map_err(map_redis_error)?;

        items
            .into_iter()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn take_front(&self, list: &StoreKey, count: usize) -> StoreResult<Vec<Value>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        // LPOP with a count needs Redis 6.2; nil when the list is missing.
        let items: Option<Vec<String>> = redis::cmd("LPOP")
            .arg(self.key(list))
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        items
            .unwrap_or_default()
            .into_iter()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn delete(&self, key: &StoreKey) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(self.key(key)).await.map_err(map_redis_error)?;
        Ok(removed > 0)
    }
}
