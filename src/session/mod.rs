//! Per-user conversation handles and local history.

mod registry;

pub use registry::{DEFAULT_HISTORY_LIMIT, ThreadRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{MessageRole, ThreadId};

/// A user's binding to an upstream conversation. Replaced wholesale, never
/// edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHandle {
    pub user_id: String,
    pub external_thread_id: ThreadId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            recorded_at: at,
        }
    }

    pub fn assistant(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
            recorded_at: at,
        }
    }
}

/// Queued request to delete everything kept for an abandoned conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeMarker {
    pub user_id: String,
    pub thread_id: ThreadId,
    pub marked_at: DateTime<Utc>,
}
