//! Per-user request rate limiting and daily token caps.

mod limiter;

pub use limiter::{Admission, QuotaUsage, RateLimiter, UserQuota};

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub max_requests: u32,
    pub daily_token_cap: u64,
    /// Offset of the users' local day from UTC; daily counters roll at local midnight.
    pub utc_offset_minutes: i32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 10,
            daily_token_cap: 50_000,
            utc_offset_minutes: 0,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(i64::try_from(self.window_seconds).unwrap_or(i64::MAX / 1_000))
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or(Utc.fix())
    }
}

/// First instant of the local day after the one containing `now`.
pub fn next_local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    local
        .date_naive()
        .succ_opt()
        .and_then(|next| offset.from_local_datetime(&next.and_time(NaiveTime::MIN)).single())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or(now + Duration::days(1))
}

/// `YYYY-MM-DD` of the local day containing `now`.
pub fn local_day(now: DateTime<Utc>, offset: FixedOffset) -> String {
    now.with_timezone(&offset).format("%Y-%m-%d").to_string()
}
