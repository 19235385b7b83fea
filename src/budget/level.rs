//! Service levels derived from budget utilization.
//!
//! [`select_service_level`] is a pure function of the utilization ratio, the
//! caller's tier and a [`ServiceLevelTable`]; nothing here is persisted.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    Normal,
    Warning,
    Slowdown,
    Emergency,
    Shutoff,
}

impl fmt::Display for ServiceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Slowdown => "slowdown",
            Self::Emergency => "emergency",
            Self::Shutoff => "shutoff",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    #[default]
    Free,
    Premium,
}

impl fmt::Display for UserTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Premium => f.write_str("premium"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Standard,
    Economy,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::Economy => f.write_str("economy"),
        }
    }
}

/// Lower bounds (as fractions of the monthly ceiling) of each degraded level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub warning: f64,
    pub slowdown: f64,
    pub emergency: f64,
    pub shutoff: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 0.70,
            slowdown: 0.85,
            emergency: 0.95,
            shutoff: 1.00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_tokens: u32,
    #[serde(default)]
    pub model_tier: ModelTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub free: TierLimits,
    pub premium: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits {
                max_tokens: 1_500,
                model_tier: ModelTier::Standard,
            },
            premium: TierLimits {
                max_tokens: 4_000,
                model_tier: ModelTier::Standard,
            },
        }
    }
}

impl TierTable {
    pub fn limits(&self, tier: UserTier) -> TierLimits {
        match tier {
            UserTier::Free => self.free,
            UserTier::Premium => self.premium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradedLimits {
    pub reduced_max_tokens: u32,
    pub minimal_max_tokens: u32,
}

impl Default for DegradedLimits {
    fn default() -> Self {
        Self {
            reduced_max_tokens: 800,
            minimal_max_tokens: 300,
        }
    }
}

/// Concrete upstream model names for each [`ModelTier`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelNames {
    pub standard: String,
    pub economy: String,
}

impl Default for ModelNames {
    fn default() -> Self {
        Self {
            standard: "claude-sonnet-4-5".to_string(),
            economy: "claude-haiku-4-5".to_string(),
        }
    }
}

impl ModelNames {
    pub fn name_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Standard => &self.standard,
            ModelTier::Economy => &self.economy,
        }
    }
}

/// What a single request is allowed to do at the current utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub level: ServiceLevel,
    pub enabled: bool,
    pub max_tokens: u32,
    pub model_tier: ModelTier,
}

/// Ordered `(exclusive upper bound, level)` bands plus the per-tier limits
/// each level applies.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceLevelTable {
    bands: Vec<(f64, ServiceLevel)>,
    tiers: TierTable,
    degraded: DegradedLimits,
}

impl ServiceLevelTable {
    pub fn new(thresholds: Thresholds, tiers: TierTable, degraded: DegradedLimits) -> Self {
        Self {
            bands: vec![
                (thresholds.warning, ServiceLevel::Normal),
                (thresholds.slowdown, ServiceLevel::Warning),
                (thresholds.emergency, ServiceLevel::Slowdown),
                (thresholds.shutoff, ServiceLevel::Emergency),
            ],
            tiers,
            degraded,
        }
    }

    pub fn level_for(&self, ratio: f64) -> ServiceLevel {
        // NaN compares false against every bound and falls through.
        self.bands
            .iter()
            .find(|(upper, _)| ratio < *upper)
            .map(|(_, level)| *level)
            .unwrap_or(ServiceLevel::Shutoff)
    }
}

impl Default for ServiceLevelTable {
    fn default() -> Self {
        Self::new(
            Thresholds::default(),
            TierTable::default(),
            DegradedLimits::default(),
        )
    }
}

pub fn select_service_level(ratio: f64, tier: UserTier, table: &ServiceLevelTable) -> ServicePlan {
    let level = table.level_for(ratio);
    let limits = table.tiers.limits(tier);
    let reduced = limits.max_tokens.min(table.degraded.reduced_max_tokens);
    let minimal = limits.max_tokens.min(table.degraded.minimal_max_tokens);

    let plan = |enabled, max_tokens, model_tier| ServicePlan {
        level,
        enabled,
        max_tokens,
        model_tier,
    };

    match (level, tier) {
        (ServiceLevel::Normal, _) | (ServiceLevel::Warning, UserTier::Premium) => {
            plan(true, limits.max_tokens, limits.model_tier)
        }
        (ServiceLevel::Warning, UserTier::Free) => plan(true, reduced, limits.model_tier),
        (ServiceLevel::Slowdown, _) => plan(true, reduced, ModelTier::Economy),
        (ServiceLevel::Emergency, UserTier::Premium) => plan(true, minimal, ModelTier::Economy),
        (ServiceLevel::Emergency, UserTier::Free) | (ServiceLevel::Shutoff, _) => {
            plan(false, 0, ModelTier::Economy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(ratio: f64, tier: UserTier) -> ServicePlan {
        select_service_level(ratio, tier, &ServiceLevelTable::default())
    }

    #[test]
    fn test_band_boundaries_are_inclusive_below() {
        let table = ServiceLevelTable::default();
        assert_eq!(table.level_for(0.0), ServiceLevel::Normal);
        assert_eq!(table.level_for(0.6999), ServiceLevel::Normal);
        assert_eq!(table.level_for(0.70), ServiceLevel::Warning);
        assert_eq!(table.level_for(0.85), ServiceLevel::Slowdown);
        assert_eq!(table.level_for(0.95), ServiceLevel::Emergency);
        assert_eq!(table.level_for(1.00), ServiceLevel::Shutoff);
        assert_eq!(table.level_for(f64::INFINITY), ServiceLevel::Shutoff);
    }

    #[test]
    fn test_nan_fails_closed_and_negative_is_normal() {
        assert_eq!(select(f64::NAN, UserTier::Premium).level, ServiceLevel::Shutoff);
        assert!(!select(f64::NAN, UserTier::Premium).enabled);
        assert_eq!(select(-0.2, UserTier::Free).level, ServiceLevel::Normal);
    }

    #[test]
    fn test_normal_uses_tier_defaults() {
        let plan = select(0.50, UserTier::Premium);
        assert_eq!(plan.level, ServiceLevel::Normal);
        assert!(plan.enabled);
        assert_eq!(plan.max_tokens, 4_000);
        assert_eq!(plan.model_tier, ModelTier::Standard);
    }

    #[test]
    fn test_warning_reduces_free_only() {
        let free = select(0.72, UserTier::Free);
        assert_eq!(free.level, ServiceLevel::Warning);
        assert!(free.enabled);
        assert_eq!(free.max_tokens, 800);

        let premium = select(0.72, UserTier::Premium);
        assert_eq!(premium.max_tokens, 4_000);
        assert_eq!(premium.model_tier, ModelTier::Standard);
    }

    #[test]
    fn test_slowdown_switches_to_economy() {
        let plan = select(0.90, UserTier::Premium);
        assert_eq!(plan.level, ServiceLevel::Slowdown);
        assert!(plan.enabled);
        assert_eq!(plan.max_tokens, 800);
        assert_eq!(plan.model_tier, ModelTier::Economy);
    }

    #[test]
    fn test_emergency_denies_free() {
        let free = select(0.97, UserTier::Free);
        assert_eq!(free.level, ServiceLevel::Emergency);
        assert!(!free.enabled);

        let premium = select(0.97, UserTier::Premium);
        assert!(premium.enabled);
        assert_eq!(premium.max_tokens, 300);
        assert_eq!(premium.model_tier, ModelTier::Economy);
    }

    #[test]
    fn test_shutoff_denies_everyone() {
        for tier in [UserTier::Free, UserTier::Premium] {
            let plan = select(1.05, tier);
            assert_eq!(plan.level, ServiceLevel::Shutoff);
            assert!(!plan.enabled);
        }
    }

    #[test]
    fn test_model_names() {
        let names = ModelNames::default();
        assert_eq!(names.name_for(ModelTier::Economy), "claude-haiku-4-5");
        assert_eq!(ServiceLevel::Slowdown.to_string(), "slowdown");
    }
}
