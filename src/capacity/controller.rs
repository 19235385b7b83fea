use std::sync::Arc;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CapacityConfig, CapacitySignals, ConcurrencyLimit, SignalSource};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityDecision {
    pub desired: u32,
    pub previous: u32,
    /// Ceiling in force after this cycle.
    pub ceiling: u32,
    pub applied: bool,
    /// Set when a critical error rate overrode the computed ceiling.
    pub forced: bool,
}

pub struct CapacityController {
    config: CapacityConfig,
    limit: ConcurrencyLimit,
}

impl CapacityController {
    pub fn new(config: CapacityConfig, limit: ConcurrencyLimit) -> Self {
        Self { config, limit }
    }

    pub fn limit(&self) -> &ConcurrencyLimit {
        &self.limit
    }

    /// Ceiling the signals call for, before hysteresis.
    pub fn desired_ceiling(&self, signals: &CapacitySignals) -> u32 {
        let c = &self.config;
        let baseline = c.time_of_day_baseline(signals.local_hour);
        let tier = c.usage_tier_ceiling(signals.token_utilization());
        let slots = if c.requests_per_slot > 0.0 && signals.requests_per_minute.is_finite() {
            (signals.requests_per_minute.max(0.0) / c.requests_per_slot).ceil() as u32
        } else {
            0
        };

        baseline
            .max(tier.max(slots))
            .clamp(c.min_ceiling, c.absolute_max_ceiling.max(c.min_ceiling))
    }

    /// One control cycle over already-sampled signals.
    pub fn evaluate(&self, signals: &CapacitySignals) -> CapacityDecision {
        let previous = self.limit.ceiling();
        // NaN error rates count as critical.
        let forced = !(signals.error_rate < self.config.critical_error_rate);

        let (desired, applied) = if forced {
            let max = self.config.absolute_max_ceiling;
            (max, max != previous)
        } else {
            let desired = self.desired_ceiling(signals);
            (desired, desired.abs_diff(previous) >= self.config.hysteresis)
        };

        if applied {
            self.limit.set_ceiling(desired);
            info!(
                previous,
                ceiling = desired,
                forced,
                error_rate = signals.error_rate,
                rpm = signals.requests_per_minute,
                "Concurrency ceiling adjusted"
            );
        } else {
            debug!(previous, desired, "Concurrency ceiling unchanged");
        }

        CapacityDecision {
            desired,
            previous,
            ceiling: self.limit.ceiling(),
            applied,
            forced,
        }
    }

    pub async fn tick(&self, source: &dyn SignalSource) -> Result<CapacityDecision> {
        let signals = source.sample().await?;
        Ok(self.evaluate(&signals))
    }

    /// Runs a cycle every configured period until `shutdown` fires.
    pub async fn run(&self, source: Arc<dyn SignalSource>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Capacity controller stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(source.as_ref()).await {
                        warn!(error = %e, "Capacity cycle skipped: failed to sample signals");
                    }
                }
            }
        }
    }
}
