//! Monthly budget accounting and the service levels derived from it.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

mod level;
mod monitor;
pub mod pricing;

pub use level::{
    DegradedLimits, ModelNames, ModelTier, ServiceLevel, ServiceLevelTable, ServicePlan,
    Thresholds, TierLimits, TierTable, UserTier, select_service_level,
};
pub use monitor::{BillingPeriod, BudgetMonitor, BudgetSnapshot, LedgerEntry};
pub use pricing::{ModelPricing, PricingTable, PricingTableBuilder, global_pricing_table};

/// Scale factor for storing Decimal costs as integer micro-dollars (6 decimal places precision).
pub(crate) const COST_SCALE_FACTOR: Decimal = dec!(1_000_000);
