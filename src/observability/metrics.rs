//! Atomic metrics for local tracking.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::ErrorKind;
use crate::budget::COST_SCALE_FACTOR;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram. The sum is kept scaled by 1000 so sub-unit
/// observations are not lost.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Request latency in milliseconds; completions routinely take tens of seconds.
    pub fn request_latency() -> Self {
        Self::new(vec![
            250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0, 120_000.0,
        ])
    }

    pub fn poll_counts() -> Self {
        Self::new(vec![1.0, 2.0, 5.0, 10.0, 20.0, 45.0, 90.0])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0 / count as f64
    }
}

/// Gateway metrics.
#[derive(Debug)]
pub struct MetricsRegistry {
    pub requests_total: Counter,
    pub requests_completed: Counter,
    pub denied_rate_limited: Counter,
    pub denied_daily_cap: Counter,
    pub denied_budget: Counter,
    pub upstream_failures: Counter,
    pub timeouts: Counter,
    pub other_errors: Counter,
    pub stale_threads_replaced: Counter,
    pub tokens_input: Counter,
    pub tokens_output: Counter,
    pub cost_total_micros: Counter,
    pub in_flight: Gauge,
    pub concurrency_ceiling: Gauge,
    pub request_latency_ms: Histogram,
    pub polls_per_job: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::new(),
            requests_completed: Counter::new(),
            denied_rate_limited: Counter::new(),
            denied_daily_cap: Counter::new(),
            denied_budget: Counter::new(),
            upstream_failures: Counter::new(),
            timeouts: Counter::new(),
            other_errors: Counter::new(),
            stale_threads_replaced: Counter::new(),
            tokens_input: Counter::new(),
            tokens_output: Counter::new(),
            cost_total_micros: Counter::new(),
            in_flight: Gauge::new(),
            concurrency_ceiling: Gauge::new(),
            request_latency_ms: Histogram::request_latency(),
            polls_per_job: Histogram::poll_counts(),
        }
    }

    pub fn record_request_start(&self) {
        self.requests_total.inc();
        self.in_flight.inc();
    }

    pub fn record_request_end(&self, outcome: Option<ErrorKind>, latency_ms: f64) {
        self.in_flight.dec();
        self.request_latency_ms.observe(latency_ms);

        let counter = match outcome {
            None => &self.requests_completed,
            Some(ErrorKind::RateLimited) => &self.denied_rate_limited,
            Some(ErrorKind::DailyCapReached) => &self.denied_daily_cap,
            Some(ErrorKind::BudgetExhausted | ErrorKind::Shutoff) => &self.denied_budget,
            Some(ErrorKind::UpstreamFailure) => &self.upstream_failures,
            Some(ErrorKind::Timeout) => &self.timeouts,
            Some(_) => &self.other_errors,
        };
        counter.inc();
    }

    pub fn record_job(&self, polls: u32, input_tokens: u64, output_tokens: u64) {
        self.polls_per_job.observe(polls as f64);
        self.tokens_input.add(input_tokens);
        self.tokens_output.add(output_tokens);
    }

    pub fn record_cost(&self, cost_usd: Decimal) {
        let micros = (cost_usd * COST_SCALE_FACTOR).to_u64().unwrap_or(0);
        self.cost_total_micros.add(micros);
    }

    pub fn total_cost_usd(&self) -> Decimal {
        Decimal::from(self.cost_total_micros.get()) / COST_SCALE_FACTOR
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub denied_requests: u64,
    pub failed_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: Decimal,
    pub avg_latency_ms: f64,
    pub avg_polls: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        Self {
            total_requests: registry.requests_total.get(),
            completed_requests: registry.requests_completed.get(),
            denied_requests: registry.denied_rate_limited.get()
                + registry.denied_daily_cap.get()
                + registry.denied_budget.get(),
            failed_requests: registry.upstream_failures.get()
                + registry.timeouts.get()
                + registry.other_errors.get(),
            total_input_tokens: registry.tokens_input.get(),
            total_output_tokens: registry.tokens_output.get(),
            total_cost_usd: registry.total_cost_usd(),
            avg_latency_ms: registry.request_latency_ms.mean(),
            avg_polls: registry.polls_per_job.mean(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(0);
        gauge.dec();
        assert_eq!(gauge.get(), -1);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 50.0, 100.0]);
        for v in [5.0, 25.0, 75.0, 150.0] {
            hist.observe(v);
        }
        assert_eq!(hist.count(), 4);
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1, 1]);
        assert_eq!(hist.mean(), 63.75);
    }

    #[test]
    fn test_registry_classifies_outcomes() {
        let registry = MetricsRegistry::default();
        for outcome in [
            None,
            Some(ErrorKind::RateLimited),
            Some(ErrorKind::Shutoff),
            Some(ErrorKind::Timeout),
        ] {
            registry.record_request_start();
            registry.record_request_end(outcome, 1_200.0);
        }
        registry.record_job(3, 100, 50);
        registry.record_cost(dec!(0.00885));

        let summary = registry.summary();
        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.completed_requests, 1);
        assert_eq!(summary.denied_requests, 2);
        assert_eq!(summary.failed_requests, 1);
        assert_eq!(summary.total_cost_usd, dec!(0.00885));
        assert_eq!(registry.in_flight.get(), 0);
    }
}
