//! # assistant-gate
//!
//! Admission control and orchestration for AI assistant requests running under
//! a hard monthly cost ceiling.
//!
//! A request passes a per-user rate limiter, then a budget-driven service
//! level decides whether (and with which model and token allowance) it runs.
//! The user's upstream conversation is resolved, a completion job is
//! submitted, and the poller drives it to a terminal state before usage is
//! charged back to the shared budget.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use assistant_gate::budget::UserTier;
//! use assistant_gate::config::GateConfig;
//! use assistant_gate::gateway::Gateway;
//! use assistant_gate::provider::{HttpAssistantProvider, HttpProviderConfig};
//! use assistant_gate::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GateConfig::load("gate.yaml").await?;
//!     let provider = HttpAssistantProvider::new(
//!         HttpProviderConfig::from_env().ok_or("provider credentials missing")?,
//!     )?;
//!
//!     let gateway = Gateway::builder()
//!         .config(config)
//!         .store(Arc::new(MemoryStore::new()))
//!         .provider(Arc::new(provider))
//!         .build()?;
//!
//!     let reply = gateway
//!         .submit_message("user-42", "How do refunds work?", UserTier::Free)
//!         .await?;
//!     println!("[{}] {}", reply.level, reply.artifact);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod budget;
pub mod capacity;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod observability;
pub mod poller;
pub mod prelude;
pub mod provider;
pub mod quota;
pub mod session;
pub mod store;
pub mod testing;

pub use budget::{ServiceLevel, ServicePlan, UserTier};
pub use config::{ConfigError, GateConfig};
pub use gateway::{Gateway, GatewayBuilder, Reply, ServiceStatus};
pub use provider::{AssistantProvider, ProviderError, ThreadId};
pub use store::{MemoryStore, Store, StoreError};

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Error type for gateway operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Too many requests from this user inside the sliding window.
    #[error("Rate limit exceeded, retry in {:.0}s", retry_after.as_secs_f64().ceil())]
    RateLimited { retry_after: Duration },

    /// The user's tokens for the current local day are used up.
    #[error("Daily token cap reached, resets at {resets_at}")]
    DailyCapReached { resets_at: DateTime<Utc> },

    /// The current service level does not serve this tier.
    #[error("Service is in {level} mode; {tier} requests are paused")]
    BudgetExhausted { level: ServiceLevel, tier: UserTier },

    /// Monthly budget is spent; nothing is served.
    #[error("Monthly budget exhausted ({:.0}% used)", utilization * 100.0)]
    Shutoff { utilization: f64 },

    /// The upstream job ended in failure.
    #[error("Upstream job failed: {reason}")]
    UpstreamFailure { reason: String },

    /// The job did not finish within the polling budget.
    #[error("Timed out after {polls} polls ({:.1}s)", elapsed.as_secs_f64())]
    Timeout { elapsed: Duration, polls: u32 },

    /// Store kept failing transiently after bounded retries.
    #[error("Store temporarily unavailable: {0}")]
    TransientStore(StoreError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        if error.is_transient() {
            Error::TransientStore(error)
        } else {
            Error::Store(error)
        }
    }
}

/// Machine-checkable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimited,
    DailyCapReached,
    BudgetExhausted,
    Shutoff,
    UpstreamFailure,
    Timeout,
    TransientStore,
    Store,
    Provider,
    Config,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::DailyCapReached => "daily_cap_reached",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::Shutoff => "shutoff",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientStore => "transient_store",
            ErrorKind::Store => "store",
            ErrorKind::Provider => "provider",
            ErrorKind::Config => "config",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::DailyCapReached { .. } => ErrorKind::DailyCapReached,
            Error::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            Error::Shutoff { .. } => ErrorKind::Shutoff,
            Error::UpstreamFailure { .. } => ErrorKind::UpstreamFailure,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::TransientStore(_) => ErrorKind::TransientStore,
            Error::Store(_) => ErrorKind::Store,
            Error::Provider(_) => ErrorKind::Provider,
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Raised before any upstream call was made.
    pub fn is_admission_denial(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited
                | ErrorKind::DailyCapReached
                | ErrorKind::BudgetExhausted
                | ErrorKind::Shutoff
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::TransientStore(_) | Error::Timeout { .. } => true,
            Error::Provider(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
