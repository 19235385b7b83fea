//! Environment Variable Overrides
//!
//! Overlays `GATE_*` environment variables onto a [`GateConfig`]. Environment
//! variables are read, never written, since mutating them is not thread-safe.

use serde_json::Value;

use super::{ConfigError, ConfigResult, GateConfig};

pub const DEFAULT_PREFIX: &str = "GATE_";

/// Dotted config paths that may be overridden from the environment.
pub const OVERRIDABLE_KEYS: &[&str] = &[
    "monthly_budget_ceiling_usd",
    "thresholds.warning",
    "thresholds.slowdown",
    "thresholds.emergency",
    "thresholds.shutoff",
    "models.standard",
    "models.economy",
    "rate_limit.window_seconds",
    "rate_limit.max_requests",
    "rate_limit.daily_token_cap",
    "rate_limit.utc_offset_minutes",
    "poller.interval_ms",
    "poller.max_polls",
    "poller.transient_retry_budget",
    "poller.call_timeout_ms",
    "capacity.period_secs",
    "capacity.min_ceiling",
    "capacity.absolute_max_ceiling",
    "capacity.hysteresis",
    "capacity.critical_error_rate",
    "capacity.daily_token_budget",
    "store.key_prefix",
    "store.max_retries",
];

#[derive(Debug, Clone)]
pub struct EnvOverrides {
    prefix: String,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `rate_limit.max_requests` -> `GATE_RATE_LIMIT_MAX_REQUESTS`
    pub fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }

    pub fn apply(&self, config: GateConfig) -> ConfigResult<GateConfig> {
        self.apply_from(config, |name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup` instead of the process environment.
    pub fn apply_from(
        &self,
        config: GateConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<GateConfig> {
        let mut tree = serde_json::to_value(&config)?;
        let mut applied = 0;

        for key in OVERRIDABLE_KEYS {
            let Some(raw) = lookup(&self.env_key(key)) else {
                continue;
            };
            let pointer = format!("/{}", key.replace('.', "/"));
            let slot = tree
                .pointer_mut(&pointer)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "unknown configuration path".into(),
                })?;
            *slot = parse_scalar(slot, &raw);
            applied += 1;
        }

        if applied > 0 {
            tracing::debug!(count = applied, prefix = %self.prefix, "Applied environment overrides");
        }

        serde_json::from_value(tree).map_err(|e| ConfigError::InvalidValue {
            key: self.prefix.clone(),
            message: e.to_string(),
        })
    }
}

impl Default for EnvOverrides {
    fn default() -> Self {
        Self::new()
    }
}

// Strings stay strings; everything else is read as JSON so numbers keep their type.
fn parse_scalar(current: &Value, raw: &str) -> Value {
    match current {
        Value::String(_) => Value::String(raw.to_string()),
        _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}
