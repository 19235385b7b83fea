//! Deterministic test doubles for the provider and the store.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::provider::{
    Annotation, AssistantProvider, JobHandle, JobId, JobRequest, JobStatus, MessageRole,
    ProviderError, ProviderMessage, ProviderResult, ThreadId, TokenUsage, UpstreamJobState,
};
use crate::store::{Store, StoreError, StoreKey, StoreResult, TxnFn};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Provider that plays back a scripted sequence of job statuses.
///
/// Once the script runs out every status fetch returns the fallback status,
/// which defaults to a completed job.
#[derive(Debug)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ProviderResult<JobStatus>>>,
    listing_errors: Mutex<VecDeque<ProviderError>>,
    fallback: Mutex<JobStatus>,
    reply: Mutex<Vec<ProviderMessage>>,
    missing_threads: Mutex<HashSet<ThreadId>>,
    create_delay: Duration,
    next_id: AtomicU64,
    threads_created: AtomicU32,
    status_calls: AtomicU32,
    listing_calls: AtomicU32,
    appended: Mutex<Vec<(ThreadId, String)>>,
    submitted: Mutex<Vec<(ThreadId, JobRequest)>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            listing_errors: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(JobStatus::completed(TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            })),
            reply: Mutex::new(vec![assistant_message("msg_reply", "Hello from the assistant.")]),
            missing_threads: Mutex::new(HashSet::new()),
            create_delay: Duration::ZERO,
            next_id: AtomicU64::new(1),
            threads_created: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            listing_calls: AtomicU32::new(0),
            appended: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn then_status(self, status: JobStatus) -> Self {
        lock(&self.script).push_back(Ok(status));
        self
    }

    pub fn then_state(self, state: UpstreamJobState) -> Self {
        self.then_status(JobStatus::new(state))
    }

    pub fn then_error(self, error: ProviderError) -> Self {
        lock(&self.script).push_back(Err(error));
        self
    }

    /// Fails the next message listing with `error`; queued errors play back in order.
    pub fn then_listing_error(self, error: ProviderError) -> Self {
        lock(&self.listing_errors).push_back(error);
        self
    }

    pub fn fallback_status(self, status: JobStatus) -> Self {
        *lock(&self.fallback) = status;
        self
    }

    /// Replaces the assistant reply returned once a job completes.
    pub fn reply(self, text: impl Into<String>) -> Self {
        *lock(&self.reply) = vec![assistant_message("msg_reply", text)];
        self
    }

    pub fn reply_with_annotations(self, text: impl Into<String>, annotations: Vec<Annotation>) -> Self {
        let mut message = assistant_message("msg_reply", text);
        message.annotations = annotations;
        *lock(&self.reply) = vec![message];
        self
    }

    /// Newest first, as the provider would return them.
    pub fn messages(self, messages: Vec<ProviderMessage>) -> Self {
        *lock(&self.reply) = messages;
        self
    }

    pub fn create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Makes the upstream forget `thread`, as after an expiry.
    pub fn forget_thread(&self, thread: &ThreadId) {
        lock(&self.missing_threads).insert(thread.clone());
    }

    pub fn threads_created(&self) -> u32 {
        self.threads_created.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> u32 {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn appended(&self) -> Vec<(ThreadId, String)> {
        lock(&self.appended).clone()
    }

    pub fn submitted(&self) -> Vec<(ThreadId, JobRequest)> {
        lock(&self.submitted).clone()
    }

    fn check_thread(&self, thread: &ThreadId) -> ProviderResult<()> {
        if lock(&self.missing_threads).contains(thread) {
            return Err(ProviderError::NotFound {
                resource: thread.to_string(),
            });
        }
        Ok(())
    }
}

pub fn assistant_message(id: impl Into<String>, text: impl Into<String>) -> ProviderMessage {
    ProviderMessage {
        id: id.into(),
        role: MessageRole::Assistant,
        text: text.into(),
        annotations: Vec::new(),
        created_at: Utc::now(),
    }
}

#[async_trait::async_trait]
impl AssistantProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_conversation(&self) -> ProviderResult<ThreadId> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.threads_created.fetch_add(1, Ordering::SeqCst);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(ThreadId(format!("thread_{}", n)))
    }

    async fn append_message(&self, thread: &ThreadId, text: &str) -> ProviderResult<()> {
        self.check_thread(thread)?;
        lock(&self.appended).push((thread.clone(), text.to_string()));
        Ok(())
    }

    async fn submit_job(&self, thread: &ThreadId, request: &JobRequest) -> ProviderResult<JobHandle> {
        self.check_thread(thread)?;
        lock(&self.submitted).push((thread.clone(), request.clone()));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(JobHandle {
            thread_id: thread.clone(),
            job_id: JobId(format!("run_{}", n)),
        })
    }

    async fn get_job_status(&self, _job: &JobHandle) -> ProviderResult<JobStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        match next {
            Some(result) => result,
            None => Ok(lock(&self.fallback).clone()),
        }
    }

    async fn list_messages(&self, thread: &ThreadId, limit: u32) -> ProviderResult<Vec<ProviderMessage>> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.check_thread(thread)?;
        if let Some(error) = lock(&self.listing_errors).pop_front() {
            return Err(error);
        }
        Ok(lock(&self.reply)
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// Store wrapper whose next `lost` transactions commit and then report a
/// transient failure, as when a commit acknowledgement is dropped.
pub struct AckLosingStore {
    inner: Arc<dyn Store>,
    lost: AtomicU32,
}

impl AckLosingStore {
    pub fn new(inner: Arc<dyn Store>, lost: u32) -> Self {
        Self {
            inner,
            lost: AtomicU32::new(lost),
        }
    }

    fn lose_ack(&self) -> bool {
        self.lost
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl Store for AckLosingStore {
    fn name(&self) -> &str {
        "ack-losing"
    }

    async fn get(&self, key: &StoreKey) -> StoreResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn transact(&self, key: &StoreKey, txn: &TxnFn<'_>) -> StoreResult<Value> {
        let output = self.inner.transact(key, txn).await?;
        if self.lose_ack() {
            return Err(StoreError::Transient {
                message: format!("acknowledgement for {} lost", key),
            });
        }
        Ok(output)
    }

    async fn append_and_increment(
        &self,
        list: &StoreKey,
        entry: Value,
        counter: &StoreKey,
        delta: i64,
    ) -> StoreResult<i64> {
        self.inner.append_and_increment(list, entry, counter, delta).await
    }

    async fn increment(&self, counter: &StoreKey, delta: i64) -> StoreResult<i64> {
        self.inner.increment(counter, delta).await
    }

    async fn counter(&self, key: &StoreKey) -> StoreResult<i64> {
        self.inner.counter(key).await
    }

    async fn append(&self, list: &StoreKey, entry: Value, max_len: Option<usize>) -> StoreResult<()> {
        self.inner.append(list, entry, max_len).await
    }

    async fn list(&self, key: &StoreKey) -> StoreResult<Vec<Value>> {
        self.inner.list(key).await
    }

    async fn take_front(&self, list: &StoreKey, count: usize) -> StoreResult<Vec<Value>> {
        self.inner.take_front(list, count).await
    }

    async fn delete(&self, key: &StoreKey) -> StoreResult<bool> {
        self.inner.delete(key).await
    }
}
