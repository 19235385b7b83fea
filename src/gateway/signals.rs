//! Capacity signals sampled from a running gateway.

use std::sync::Arc;

use chrono::{FixedOffset, Timelike};

use crate::Result;
use crate::capacity::{CapacitySignals, SignalSource};
use crate::clock::Clock;
use crate::observability::RequestWindow;
use crate::quota::local_day;
use crate::store::{Store, StoreKey};

/// Reads the aggregate daily token counter from the store and request load
/// from the gateway's rolling window.
pub struct GatewaySignals {
    store: Arc<dyn Store>,
    window: Arc<RequestWindow>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    daily_token_budget: u64,
}

impl GatewaySignals {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        window: Arc<RequestWindow>,
        clock: Arc<dyn Clock>,
        offset: FixedOffset,
        daily_token_budget: u64,
    ) -> Self {
        Self {
            store,
            window,
            clock,
            offset,
            daily_token_budget,
        }
    }
}

#[async_trait::async_trait]
impl SignalSource for GatewaySignals {
    async fn sample(&self) -> Result<CapacitySignals> {
        let now = self.clock.now();
        let used = self
            .store
            .counter(&StoreKey::DailyTokens(local_day(now, self.offset)))
            .await?;

        Ok(CapacitySignals {
            daily_tokens_used: u64::try_from(used).unwrap_or(0),
            daily_token_budget: self.daily_token_budget,
            requests_per_minute: self.window.requests_per_minute(now),
            error_rate: self.window.error_rate(now),
            local_hour: now.with_timezone(&self.offset).hour(),
        })
    }
}
