//! Shared monthly budget accounting.
//!
//! Accrued cost lives in one integer counter per billing period (micro-dollars)
//! next to an append-only ledger. Both are written together by
//! [`Store::append_and_increment`]; utilization only ever reads the counter.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::COST_SCALE_FACTOR;
use super::pricing::PricingTable;
use crate::store::{Store, StoreKey};
use crate::{Error, Result};

/// Calendar month in UTC, identified as `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn containing(now: DateTime<Utc>) -> Self {
        let (year, month) = (now.year(), now.month());
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };

        Self {
            id: format!("{:04}-{:02}", year, month),
            start: month_start(year, month).unwrap_or(now),
            end: month_start(next_year, next_month).unwrap_or(now),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1).map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: Decimal,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub period: BillingPeriod,
    pub accrued_usd: Decimal,
    pub ceiling_usd: Decimal,
    pub utilization: f64,
}

pub struct BudgetMonitor {
    store: Arc<dyn Store>,
    pricing: PricingTable,
    ceiling: Decimal,
}

impl BudgetMonitor {
    pub fn new(store: Arc<dyn Store>, ceiling: Decimal) -> Self {
        Self {
            store,
            pricing: PricingTable::default(),
            ceiling,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn ceiling(&self) -> Decimal {
        self.ceiling
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Cost accrued in the period containing `now`, from the running counter.
    pub async fn accrued(&self, now: DateTime<Utc>) -> Result<Decimal> {
        let period = BillingPeriod::containing(now);
        let micros = self.store.counter(&StoreKey::Budget(period.id)).await?;
        Ok(Decimal::from(micros) / COST_SCALE_FACTOR)
    }

    /// Accrued cost over the monthly ceiling. A zero ceiling reads as fully
    /// spent.
    pub async fn current_utilization(&self, now: DateTime<Utc>) -> Result<f64> {
        let accrued = self.accrued(now).await?;
        Ok(self.ratio(accrued))
    }

    fn ratio(&self, accrued: Decimal) -> f64 {
        if self.ceiling <= Decimal::ZERO {
            return f64::INFINITY;
        }
        (accrued / self.ceiling).to_f64().unwrap_or(f64::NAN)
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<BudgetSnapshot> {
        let accrued = self.accrued(now).await?;
        Ok(BudgetSnapshot {
            period: BillingPeriod::containing(now),
            accrued_usd: accrued,
            ceiling_usd: self.ceiling,
            utilization: self.ratio(accrued),
        })
    }

    /// Prices the usage, then appends the ledger entry and bumps the period
    /// counter in a single store operation.
    pub async fn record_usage(
        &self,
        user_id: &str,
        tokens_in: u64,
        tokens_out: u64,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let cost = self
            .pricing
            .calculate(model, tokens_in, tokens_out)
            .round_dp_with_strategy(6, RoundingStrategy::AwayFromZero);
        let micros = (cost * COST_SCALE_FACTOR)
            .to_i64()
            .ok_or_else(|| Error::InvalidRequest(format!("cost {} out of range", cost)))?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cost,
            recorded_at: now,
        };

        let period = BillingPeriod::containing(now);
        let total = self
            .store
            .append_and_increment(
                &StoreKey::Ledger(period.id.clone()),
                serde_json::to_value(&entry).map_err(crate::store::StoreError::from)?,
                &StoreKey::Budget(period.id.clone()),
                micros,
            )
            .await?;

        tracing::debug!(
            user_id = %user_id,
            model = %model,
            cost = %cost,
            period = %period.id,
            accrued_micros = total,
            "Recorded usage"
        );

        Ok(entry)
    }

    /// Ledger entries of a period, oldest first. For audits; utilization never
    /// reads this.
    pub async fn ledger(&self, period_id: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .store
            .load_list(&StoreKey::Ledger(period_id.to_string()))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::pricing::{ModelPricing, PricingTableBuilder};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn monitor(ceiling: Decimal) -> BudgetMonitor {
        let pricing = PricingTableBuilder::new().with_defaults().build();
        BudgetMonitor::new(Arc::new(MemoryStore::new()), ceiling).with_pricing(pricing)
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_billing_period_bounds() {
        let period = BillingPeriod::containing(at(2026, 12, 31));
        assert_eq!(period.id, "2026-12");
        assert_eq!(period.start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
        assert!(period.contains(at(2026, 12, 15)));
        assert!(!period.contains(period.end));
    }

    #[tokio::test]
    async fn test_record_usage_accrues_cost() {
        let monitor = monitor(dec!(100));
        let now = at(2026, 10, 19);

        let entry = monitor
            .record_usage("alice", 1_000_000, 100_000, "claude-sonnet-4-5", now)
            .await
            .unwrap();
        assert_eq!(entry.cost, dec!(4.5));

        assert_eq!(monitor.accrued(now).await.unwrap(), dec!(4.5));
        let utilization = monitor.current_utilization(now).await.unwrap();
        assert!((utilization - 0.045).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ledger_matches_counter() {
        let monitor = monitor(dec!(10));
        let now = at(2026, 10, 19);

        for (user, tin, tout) in [("a", 1200, 350), ("b", 77, 9), ("a", 5000, 1)] {
            monitor
                .record_usage(user, tin, tout, "claude-haiku-4-5", now)
                .await
                .unwrap();
        }

        let ledger = monitor.ledger("2026-10").await.unwrap();
        assert_eq!(ledger.len(), 3);
        let sum: Decimal = ledger.iter().map(|e| e.cost).sum();
        assert_eq!(sum, monitor.accrued(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_periods_are_independent() {
        let monitor = monitor(dec!(10));
        monitor
            .record_usage("a", 1_000_000, 0, "claude-sonnet-4-5", at(2026, 9, 30))
            .await
            .unwrap();

        assert_eq!(monitor.accrued(at(2026, 10, 1)).await.unwrap(), Decimal::ZERO);
        let snapshot = monitor.snapshot(at(2026, 9, 30)).await.unwrap();
        assert_eq!(snapshot.accrued_usd, dec!(3));
        assert_eq!(snapshot.period.id, "2026-09");
    }

    #[tokio::test]
    async fn test_sub_micro_cost_rounds_up() {
        let pricing = PricingTableBuilder::new()
            .default_pricing(ModelPricing::new(dec!(0.1), dec!(0)))
            .build();
        let monitor =
            BudgetMonitor::new(Arc::new(MemoryStore::new()), dec!(1)).with_pricing(pricing);

        let entry = monitor
            .record_usage("a", 1, 0, "whatever", at(2026, 10, 1))
            .await
            .unwrap();
        assert_eq!(entry.cost, dec!(0.000001));
    }

    #[tokio::test]
    async fn test_zero_ceiling_reads_as_exhausted() {
        let monitor = monitor(Decimal::ZERO);
        let utilization = monitor.current_utilization(at(2026, 10, 1)).await.unwrap();
        assert!(utilization.is_infinite());
    }
}
