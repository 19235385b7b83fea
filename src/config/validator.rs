//! Configuration Validation Layer
//!
//! Collects every problem in one pass instead of failing on the first.

use std::fmt::Display;

use rust_decimal::Decimal;

use super::{ConfigError, ConfigResult, GateConfig, ValidationErrors};

#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ConfigError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, key: &str, message: impl Display) -> &mut Self {
        if !ok {
            self.errors.push(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            });
        }
        self
    }

    pub fn positive<T: PartialOrd + Default + Display>(&mut self, key: &str, value: T) -> &mut Self {
        let ok = value > T::default();
        self.check(ok, key, format_args!("must be positive, got {}", value))
    }

    pub fn fraction(&mut self, key: &str, value: f64) -> &mut Self {
        self.check(
            value.is_finite() && (0.0..=1.0).contains(&value),
            key,
            format_args!("must be within [0, 1], got {}", value),
        )
    }

    pub fn finish(self) -> ConfigResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(self.errors)))
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let mut v = Validator::new();
        let t = &self.thresholds;

        v.check(
            self.monthly_budget_ceiling_usd > Decimal::ZERO,
            "monthly_budget_ceiling_usd",
            "must be positive",
        )
        .check(
            t.warning > 0.0 && t.warning < t.slowdown && t.slowdown < t.emergency && t.emergency < t.shutoff,
            "thresholds",
            format_args!(
                "must be strictly increasing and positive (warning {} < slowdown {} < emergency {} < shutoff {})",
                t.warning, t.slowdown, t.emergency, t.shutoff
            ),
        )
        .positive("tiers.free.max_tokens", self.tiers.free.max_tokens)
        .positive("tiers.premium.max_tokens", self.tiers.premium.max_tokens)
        .positive("degraded.minimal_max_tokens", self.degraded.minimal_max_tokens)
        .check(
            self.degraded.minimal_max_tokens <= self.degraded.reduced_max_tokens,
            "degraded",
            "minimal_max_tokens must not exceed reduced_max_tokens",
        )
        .check(!self.models.standard.is_empty(), "models.standard", "must not be empty")
        .check(!self.models.economy.is_empty(), "models.economy", "must not be empty")
        .positive("rate_limit.window_seconds", self.rate_limit.window_seconds)
        .positive("rate_limit.max_requests", self.rate_limit.max_requests)
        .check(
            self.rate_limit.utc_offset_minutes.abs() < 24 * 60,
            "rate_limit.utc_offset_minutes",
            "must be less than a day",
        )
        .positive("poller.interval_ms", self.poller.interval_ms)
        .positive("poller.max_polls", self.poller.max_polls)
        .positive("poller.call_timeout_ms", self.poller.call_timeout_ms);

        let c = &self.capacity;
        v.positive("capacity.period_secs", c.period_secs)
            .positive("capacity.min_ceiling", c.min_ceiling)
            .check(
                c.min_ceiling <= c.absolute_max_ceiling,
                "capacity",
                format_args!(
                    "min_ceiling {} exceeds absolute_max_ceiling {}",
                    c.min_ceiling, c.absolute_max_ceiling
                ),
            )
            .check(
                (c.min_ceiling..=c.absolute_max_ceiling).contains(&c.initial_ceiling),
                "capacity.initial_ceiling",
                format_args!(
                    "{} is outside [{}, {}]",
                    c.initial_ceiling, c.min_ceiling, c.absolute_max_ceiling
                ),
            )
            .fraction("capacity.critical_error_rate", c.critical_error_rate)
            .positive("capacity.requests_per_slot", c.requests_per_slot)
            .check(
                c.time_of_day.windows(2).all(|w| w[0].from_hour < w[1].from_hour)
                    && c.time_of_day.iter().all(|b| b.from_hour < 24),
                "capacity.time_of_day",
                "hours must be ascending and below 24",
            )
            .check(
                c.usage_tiers
                    .windows(2)
                    .all(|w| w[0].min_utilization < w[1].min_utilization),
                "capacity.usage_tiers",
                "min_utilization must be ascending",
            );

        v.finish()
    }
}
