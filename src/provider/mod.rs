//! AI assistant provider interface.
//!
//! The gateway talks to the upstream assistant service only through
//! [`AssistantProvider`]: conversations (threads), messages, and long-running
//! completion jobs (runs).

mod http;

pub use http::{HttpAssistantProvider, HttpProviderConfig};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upstream conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream job (run) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub thread_id: ThreadId,
    pub job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    pub model: String,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamJobState {
    Queued,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: UpstreamJobState,
    pub failure_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl JobStatus {
    pub fn new(state: UpstreamJobState) -> Self {
        Self {
            state,
            failure_reason: None,
            usage: None,
        }
    }

    pub fn completed(usage: TokenUsage) -> Self {
        Self {
            state: UpstreamJobState::Completed,
            failure_reason: None,
            usage: Some(usage),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: UpstreamJobState::Failed,
            failure_reason: Some(reason.into()),
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Inline source marker attached to a message's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// The literal marker as it appears in the text, e.g. `【4:0†source】`.
    pub marker: String,
    pub source: Option<String>,
    pub quote: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Transient provider failure: {message}")]
    Transient { message: String },

    #[error("Provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode provider response: {message}")]
    Decode { message: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[async_trait::async_trait]
pub trait AssistantProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_conversation(&self) -> ProviderResult<ThreadId>;

    async fn append_message(&self, thread: &ThreadId, text: &str) -> ProviderResult<()>;

    async fn submit_job(&self, thread: &ThreadId, request: &JobRequest) -> ProviderResult<JobHandle>;

    async fn get_job_status(&self, job: &JobHandle) -> ProviderResult<JobStatus>;

    /// Messages on `thread`, newest first.
    async fn list_messages(&self, thread: &ThreadId, limit: u32) -> ProviderResult<Vec<ProviderMessage>>;
}
