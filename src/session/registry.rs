//! Thread registry.
//!
//! Concurrent first requests from one user must not each create an upstream
//! conversation. Creation is single-flighted per user inside the process, and
//! the write is a create-if-absent transaction so that two gateway processes
//! racing on the same user still converge on one stored handle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ConversationHandle, HistoryEntry, PurgeMarker};
use crate::Result;
use crate::provider::{AssistantProvider, ThreadId};
use crate::store::{Store, StoreError, StoreKey};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

pub struct ThreadRegistry {
    store: Arc<dyn Store>,
    provider: Arc<dyn AssistantProvider>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    history_limit: usize,
}

impl ThreadRegistry {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn AssistantProvider>) -> Self {
        Self {
            store,
            provider,
            inflight: DashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub async fn current(&self, user_id: &str) -> Result<Option<ConversationHandle>> {
        Ok(self
            .store
            .load(&StoreKey::Thread(user_id.to_string()))
            .await?)
    }

    /// Returns the user's handle, creating an upstream conversation on first use.
    pub async fn resolve(&self, user_id: &str, now: DateTime<Utc>) -> Result<ConversationHandle> {
        if let Some(handle) = self.current(user_id).await? {
            return Ok(handle);
        }

        let gate = self.gate(user_id);
        let result = {
            let _guard = gate.lock().await;
            match self.current(user_id).await {
                Ok(Some(handle)) => Ok(handle),
                Ok(None) => self.create_if_absent(user_id, now).await,
                Err(e) => Err(e),
            }
        };
        drop(gate);
        self.release_gate(user_id);
        result
    }

    async fn create_if_absent(&self, user_id: &str, now: DateTime<Utc>) -> Result<ConversationHandle> {
        let candidate = self.new_handle(user_id, now).await?;

        let stored: ConversationHandle = self
            .store
            .update(
                &StoreKey::Thread(user_id.to_string()),
                |current: Option<ConversationHandle>| match current {
                    Some(existing) => (None, existing),
                    None => (Some(candidate.clone()), candidate.clone()),
                },
            )
            .await?;

        if stored.external_thread_id != candidate.external_thread_id {
            debug!(
                user_id = %user_id,
                discarded = %candidate.external_thread_id,
                "Adopted conversation created concurrently elsewhere"
            );
        }
        Ok(stored)
    }

    /// Swaps in a fresh conversation after the upstream reported
    /// `stale` as not found. If the stored handle has already moved on, the
    /// newer one is returned instead.
    pub async fn replace_stale(
        &self,
        user_id: &str,
        stale: &ThreadId,
        now: DateTime<Utc>,
    ) -> Result<ConversationHandle> {
        let gate = self.gate(user_id);
        let result = {
            let _guard = gate.lock().await;
            self.swap_stale(user_id, stale, now).await
        };
        drop(gate);
        self.release_gate(user_id);
        result
    }

    async fn swap_stale(
        &self,
        user_id: &str,
        stale: &ThreadId,
        now: DateTime<Utc>,
    ) -> Result<ConversationHandle> {
        if let Some(handle) = self.current(user_id).await?
            && handle.external_thread_id != *stale
        {
            return Ok(handle);
        }

        let candidate = self.new_handle(user_id, now).await?;
        let stored: ConversationHandle = self
            .store
            .update(
                &StoreKey::Thread(user_id.to_string()),
                |current: Option<ConversationHandle>| match current {
                    Some(existing) if existing.external_thread_id != *stale => (None, existing),
                    _ => (Some(candidate.clone()), candidate.clone()),
                },
            )
            .await?;

        info!(
            user_id = %user_id,
            stale = %stale,
            replacement = %stored.external_thread_id,
            "Replaced stale conversation"
        );
        Ok(stored)
    }

    /// Unconditionally starts a new conversation and queues the old one's
    /// local history for deletion.
    pub async fn reset(&self, user_id: &str, now: DateTime<Utc>) -> Result<ConversationHandle> {
        let handle = self.new_handle(user_id, now).await?;

        let previous: Option<ConversationHandle> = self
            .store
            .update(
                &StoreKey::Thread(user_id.to_string()),
                |current: Option<ConversationHandle>| match current {
                    // Re-run after our own write committed; nothing older to purge.
                    Some(mine) if mine.external_thread_id == handle.external_thread_id => {
                        (None, None)
                    }
                    previous => (Some(handle.clone()), previous),
                },
            )
            .await?;

        if let Some(previous) = previous {
            let marker = PurgeMarker {
                user_id: user_id.to_string(),
                thread_id: previous.external_thread_id,
                marked_at: now,
            };
            self.store
                .append(&StoreKey::PurgeQueue, to_value(&marker)?, None)
                .await?;
        }
        self.store
            .delete(&StoreKey::History(user_id.to_string()))
            .await?;

        info!(user_id = %user_id, thread_id = %handle.external_thread_id, "Conversation reset");
        Ok(handle)
    }

    pub async fn record_exchange(&self, user_id: &str, entry: HistoryEntry) -> Result<()> {
        self.store
            .append(
                &StoreKey::History(user_id.to_string()),
                to_value(&entry)?,
                Some(self.history_limit),
            )
            .await?;
        Ok(())
    }

    /// Local history, oldest first.
    pub async fn history(&self, user_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .store
            .load_list(&StoreKey::History(user_id.to_string()))
            .await?)
    }

    pub async fn pending_purges(&self) -> Result<Vec<PurgeMarker>> {
        Ok(self.store.load_list(&StoreKey::PurgeQueue).await?)
    }

    /// Removes up to `limit` markers, oldest first, for a cleanup worker to
    /// act on. Taken markers are gone from the queue.
    pub async fn take_purges(&self, limit: usize) -> Result<Vec<PurgeMarker>> {
        let taken = self.store.take_front(&StoreKey::PurgeQueue, limit).await?;
        let markers = taken
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<PurgeMarker>, _>>()
            .map_err(StoreError::from)?;
        if !markers.is_empty() {
            debug!(count = markers.len(), "Took purge markers");
        }
        Ok(markers)
    }

    async fn new_handle(&self, user_id: &str, now: DateTime<Utc>) -> Result<ConversationHandle> {
        let thread = self.provider.create_conversation().await?;
        Ok(ConversationHandle {
            user_id: user_id.to_string(),
            external_thread_id: thread,
            created_at: now,
        })
    }

    fn gate(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.inflight.entry(user_id.to_string()).or_default().clone()
    }

    fn release_gate(&self, user_id: &str) {
        self.inflight
            .remove_if(user_id, |_, gate| Arc::strong_count(gate) == 1);
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value).map_err(StoreError::from)?)
}
