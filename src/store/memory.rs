//! In-memory store (for testing and single-instance deployments).

use std::sync::Mutex;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use super::{Store, StoreKey, StoreResult, TxnFn};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Value>,
    counters: DashMap<String, i64>,
    lists: DashMap<String, Vec<Value>>,
    // Held across the list push and counter bump so readers never see one without the other.
    ledger_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keyed records (lists and counters excluded).
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn clear(&self) {
        self.records.clear();
        self.counters.clear();
        self.lists.clear();
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &StoreKey) -> StoreResult<Option<Value>> {
        Ok(self.records.get(&key.path()).map(|v| v.value().clone()))
    }

    async fn transact(&self, key: &StoreKey, txn: &TxnFn<'_>) -> StoreResult<Value> {
        // The entry guard holds the shard lock for the whole read-modify-write.
        match self.records.entry(key.path()) {
            Entry::Occupied(mut occupied) => {
                let outcome = txn(Some(occupied.get().clone()))?;
                if let Some(value) = outcome.write {
                    occupied.insert(value);
                }
                Ok(outcome.output)
            }
            Entry::Vacant(vacant) => {
                let outcome = txn(None)?;
                if let Some(value) = outcome.write {
                    vacant.insert(value);
                }
                Ok(outcome.output)
            }
        }
    }

    async fn append_and_increment(
        &self,
        list: &StoreKey,
        entry: Value,
        counter: &StoreKey,
        delta: i64,
    ) -> StoreResult<i64> {
        let _guard = self.ledger_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.lists.entry(list.path()).or_default().push(entry);
        let mut value = self.counters.entry(counter.path()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn increment(&self, counter: &StoreKey, delta: i64) -> StoreResult<i64> {
        let mut value = self.counters.entry(counter.path()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn counter(&self, key: &StoreKey) -> StoreResult<i64> {
        Ok(self.counters.get(&key.path()).map(|v| *v).unwrap_or(0))
    }

    async fn append(
        &self,
        list: &StoreKey,
        entry: Value,
        max_len: Option<usize>,
    ) -> StoreResult<()> {
        let mut items = self.lists.entry(list.path()).or_default();
        items.push(entry);
        if let Some(max) = max_len
            && items.len() > max
        {
            let excess = items.len() - max;
            items.drain(..excess);
        }
        Ok(())
    }

    async fn list(&self, key: &StoreKey) -> StoreResult<Vec<Value>> {
        Ok(self
            .lists
            .get(&key.path())
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }

    async fn take_front(&self, list: &StoreKey, count: usize) -> StoreResult<Vec<Value>> {
        let Some(mut items) = self.lists.get_mut(&list.path()) else {
            return Ok(Vec::new());
        };
        let n = count.min(items.len());
        Ok(items.drain(..n).collect())
    }

    async fn delete(&self, key: &StoreKey) -> StoreResult<bool> {
        let path = key.path();
        let removed = self.records.remove(&path).is_some()
            | self.lists.remove(&path).is_some()
            | self.counters.remove(&path).is_some();
        Ok(removed)
    }
}
