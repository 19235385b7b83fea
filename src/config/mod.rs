//! Typed gateway configuration.
//!
//! ```rust,no_run
//! use assistant_gate::config::GateConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GateConfig::load("gate.yaml").await?;
//! println!("ceiling: ${}", config.monthly_budget_ceiling_usd);
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod file;
pub mod validator;

pub use env::EnvOverrides;
pub use validator::Validator;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{DegradedLimits, ModelNames, Thresholds, TierTable};
use crate::capacity::CapacityConfig;
use crate::poller::PollerConfig;
use crate::quota::RateLimitConfig;
use crate::store::StoreConfig;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key with invalid value
        key: String,
        /// Error message
        message: String,
    },

    /// File could not be parsed
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple validation errors
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Everything the gateway needs, in one structure. Every section has defaults,
/// so a config file only lists what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub monthly_budget_ceiling_usd: Decimal,
    pub thresholds: Thresholds,
    pub tiers: TierTable,
    pub degraded: DegradedLimits,
    pub models: ModelNames,
    pub rate_limit: RateLimitConfig,
    pub poller: PollerConfig,
    pub capacity: CapacityConfig,
    pub store: StoreConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            monthly_budget_ceiling_usd: dec!(500),
            thresholds: Thresholds::default(),
            tiers: TierTable::default(),
            degraded: DegradedLimits::default(),
            models: ModelNames::default(),
            rate_limit: RateLimitConfig::default(),
            poller: PollerConfig::default(),
            capacity: CapacityConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl GateConfig {
    /// Load from `path`, apply `GATE_*` environment overrides, then validate.
    pub async fn load(path: impl AsRef<std::path::Path>) -> ConfigResult<Self> {
        let config = file::from_file(path.as_ref()).await?;
        let config = EnvOverrides::new().apply(config)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `GATE_*` environment overrides, validated.
    pub fn from_env() -> ConfigResult<Self> {
        let config = EnvOverrides::new().apply(Self::default())?;
        config.validate()?;
        Ok(config)
    }
}
