//! Periodic concurrency-ceiling control.
//!
//! The controller never rejects work. It only resizes the
//! [`ConcurrencyLimit`] that the request path waits on.

mod controller;
mod limit;

pub use controller::{CapacityController, CapacityDecision};
pub use limit::{ConcurrencyLimit, ConcurrencyPermit};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Baseline ceiling that applies from `from_hour` (local time) onward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourBaseline {
    pub from_hour: u32,
    pub ceiling: u32,
}

/// Ceiling that applies once daily token utilization reaches `min_utilization`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageTier {
    pub min_utilization: f64,
    pub ceiling: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub period_secs: u64,
    pub min_ceiling: u32,
    pub absolute_max_ceiling: u32,
    /// Smallest change worth applying.
    pub hysteresis: u32,
    pub critical_error_rate: f64,
    /// Requests per minute one concurrency slot is expected to absorb.
    pub requests_per_slot: f64,
    pub daily_token_budget: u64,
    pub initial_ceiling: u32,
    pub time_of_day: Vec<HourBaseline>,
    pub usage_tiers: Vec<UsageTier>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        let hours = [(0, 4), (7, 8), (9, 12), (18, 8), (22, 4)];
        let tiers = [
            (0.0, 4),
            (0.25, 8),
            (0.5, 14),
            (0.75, 20),
            (0.9, 26),
            (0.95, 32),
        ];
        Self {
            period_secs: 600,
            min_ceiling: 2,
            absolute_max_ceiling: 32,
            hysteresis: 2,
            critical_error_rate: 0.25,
            requests_per_slot: 6.0,
            daily_token_budget: 2_000_000,
            initial_ceiling: 8,
            time_of_day: hours
                .into_iter()
                .map(|(from_hour, ceiling)| HourBaseline { from_hour, ceiling })
                .collect(),
            usage_tiers: tiers
                .into_iter()
                .map(|(min_utilization, ceiling)| UsageTier {
                    min_utilization,
                    ceiling,
                })
                .collect(),
        }
    }
}

impl CapacityConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn time_of_day_baseline(&self, hour: u32) -> u32 {
        self.time_of_day
            .iter()
            .rev()
            .find(|b| b.from_hour <= hour)
            .map(|b| b.ceiling)
            .unwrap_or(self.min_ceiling)
    }

    pub fn usage_tier_ceiling(&self, utilization: f64) -> u32 {
        self.usage_tiers
            .iter()
            .rev()
            .find(|t| t.min_utilization <= utilization)
            .map(|t| t.ceiling)
            .unwrap_or(self.min_ceiling)
    }
}

/// Inputs sampled once per control cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacitySignals {
    pub daily_tokens_used: u64,
    pub daily_token_budget: u64,
    pub requests_per_minute: f64,
    pub error_rate: f64,
    pub local_hour: u32,
}

impl CapacitySignals {
    /// Share of the daily token budget already used. An empty budget reads as
    /// fully used.
    pub fn token_utilization(&self) -> f64 {
        if self.daily_token_budget == 0 {
            return 1.0;
        }
        self.daily_tokens_used as f64 / self.daily_token_budget as f64
    }
}

#[async_trait::async_trait]
pub trait SignalSource: Send + Sync {
    async fn sample(&self) -> Result<CapacitySignals>;
}
