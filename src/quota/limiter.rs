//! Sliding-window rate limiter backed by the shared store.
//!
//! Each user's quota is one record mutated through [`Store::transact`], so
//! admissions for the same user serialize across every gateway instance.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{RateLimitConfig, next_local_midnight};
use crate::store::{Store, StoreKey};
use crate::{Error, Result};

// Ids recognised when a retried transaction re-applies a committed charge.
const RECENT_CHARGES: usize = 32;

/// One admitted request. The id makes a re-run admission recognise its own
/// committed write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuota {
    pub user_id: String,
    /// Admissions inside the trailing window, oldest first.
    pub admissions: VecDeque<Admission>,
    pub daily_tokens_used: u64,
    /// Next local midnight; the daily counter resets once `now` reaches it.
    pub window_reset_at: DateTime<Utc>,
    /// Most recent token charges, newest last.
    #[serde(default)]
    pub recent_charges: VecDeque<Uuid>,
}

impl UserQuota {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            user_id: user_id.into(),
            admissions: VecDeque::new(),
            daily_tokens_used: 0,
            window_reset_at: next_local_midnight(now, offset),
            recent_charges: VecDeque::new(),
        }
    }

    pub fn request_timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.admissions.iter().map(|a| a.at)
    }

    fn admitted(&self, id: Uuid) -> bool {
        self.admissions.iter().any(|a| a.id == id)
    }

    fn roll_day(&mut self, now: DateTime<Utc>, offset: FixedOffset) {
        if now >= self.window_reset_at {
            self.daily_tokens_used = 0;
            self.window_reset_at = next_local_midnight(now, offset);
        }
    }

    // A timestamp exactly `window` old has left the window.
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(oldest) = self.admissions.front()
            && now - oldest.at >= window
        {
            self.admissions.pop_front();
        }
    }

    fn push(&mut self, admission: Admission) {
        let at = self.admissions.partition_point(|a| a.at <= admission.at);
        self.admissions.insert(at, admission);
    }

    /// Adds `tokens` unless the charge `id` was already applied.
    fn charge(&mut self, id: Uuid, tokens: u64) {
        if self.recent_charges.contains(&id) {
            return;
        }
        self.daily_tokens_used = self.daily_tokens_used.saturating_add(tokens);
        self.recent_charges.push_back(id);
        while self.recent_charges.len() > RECENT_CHARGES {
            self.recent_charges.pop_front();
        }
    }

    fn refresh(&mut self, now: DateTime<Utc>, config: &RateLimitConfig) {
        self.roll_day(now, config.offset());
        self.prune(now, config.window());
    }
}

/// Read-only view of a user's standing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub requests_in_window: u32,
    pub remaining_requests: u32,
    pub daily_tokens_used: u64,
    pub remaining_daily_tokens: u64,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
enum Decision {
    Admitted { remaining_tokens: u64 },
    RateLimited { retry_after_ms: u64 },
    DailyCapReached { resets_at: DateTime<Utc> },
}

pub struct RateLimiter {
    store: Arc<dyn Store>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admits one request for `user_id` at `now`, returning the user's
    /// remaining daily tokens.
    pub async fn admit(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let config = &self.config;
        let key = StoreKey::Quota(user_id.to_string());
        let admission = Admission {
            at: now,
            id: Uuid::new_v4(),
        };

        let decision: Decision = self
            .store
            .update(&key, |current: Option<UserQuota>| {
                let mut quota =
                    current.unwrap_or_else(|| UserQuota::new(user_id, now, config.offset()));
                quota.refresh(now, config);

                // Re-run after a commit whose acknowledgement was lost.
                if quota.admitted(admission.id) {
                    let remaining_tokens =
                        config.daily_token_cap.saturating_sub(quota.daily_tokens_used);
                    return (None, Decision::Admitted { remaining_tokens });
                }

                if quota.daily_tokens_used >= config.daily_token_cap {
                    let resets_at = quota.window_reset_at;
                    return (Some(quota), Decision::DailyCapReached { resets_at });
                }

                if quota.admissions.len() >= config.max_requests as usize {
                    let retry_after = quota
                        .admissions
                        .front()
                        .map(|oldest| oldest.at + config.window() - now)
                        .and_then(|d| d.to_std().ok())
                        .unwrap_or_default();
                    let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                    return (Some(quota), Decision::RateLimited { retry_after_ms });
                }

                quota.push(admission);
                let remaining_tokens = config.daily_token_cap - quota.daily_tokens_used;
                (Some(quota), Decision::Admitted { remaining_tokens })
            })
            .await?;

        match decision {
            Decision::Admitted { remaining_tokens } => {
                debug!(user_id = %user_id, remaining_tokens, "Request admitted");
                Ok(remaining_tokens)
            }
            Decision::RateLimited { retry_after_ms } => {
                let retry_after = Duration::from_millis(retry_after_ms);
                warn!(user_id = %user_id, ?retry_after, "Rate limit exceeded");
                Err(Error::RateLimited { retry_after })
            }
            Decision::DailyCapReached { resets_at } => {
                warn!(user_id = %user_id, %resets_at, "Daily token cap reached");
                Err(Error::DailyCapReached { resets_at })
            }
        }
    }

    /// Adds consumed tokens to the user's daily counter. Returns the new total.
    pub async fn record_tokens(&self, user_id: &str, tokens: u64, now: DateTime<Utc>) -> Result<u64> {
        let config = &self.config;
        let key = StoreKey::Quota(user_id.to_string());
        let charge = Uuid::new_v4();

        let used: u64 = self
            .store
            .update(&key, |current: Option<UserQuota>| {
                let mut quota =
                    current.unwrap_or_else(|| UserQuota::new(user_id, now, config.offset()));
                quota.roll_day(now, config.offset());
                quota.charge(charge, tokens);
                let used = quota.daily_tokens_used;
                (Some(quota), used)
            })
            .await?;

        Ok(used)
    }

    pub async fn usage(&self, user_id: &str, now: DateTime<Utc>) -> Result<QuotaUsage> {
        let mut quota = self
            .store
            .load::<UserQuota>(&StoreKey::Quota(user_id.to_string()))
            .await?
            .unwrap_or_else(|| UserQuota::new(user_id, now, self.config.offset()));
        quota.refresh(now, &self.config);

        let in_window = u32::try_from(quota.admissions.len()).unwrap_or(u32::MAX);
        Ok(QuotaUsage {
            requests_in_window: in_window,
            remaining_requests: self.config.max_requests.saturating_sub(in_window),
            daily_tokens_used: quota.daily_tokens_used,
            remaining_daily_tokens: self
                .config
                .daily_token_cap
                .saturating_sub(quota.daily_tokens_used),
            resets_at: quota.window_reset_at,
        })
    }
}
