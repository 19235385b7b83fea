//! Structured span definitions for tracing.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;
use tracing::{Level, Span, field, span};

use crate::budget::{ServicePlan, UserTier};

/// Hands out request ids for the spans of one gateway.
#[derive(Debug, Default)]
pub struct SpanContext {
    request_id: AtomicU64,
}

impl SpanContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn request_span(&self, user_id: &str, tier: UserTier) -> RequestSpan {
        RequestSpan::new(self.next_request_id(), user_id, tier)
    }
}

/// `gate.request` span, filled in as the request moves through admission.
#[derive(Debug)]
pub struct RequestSpan {
    span: Span,
    start: Instant,
}

impl RequestSpan {
    pub fn new(request_id: u64, user_id: &str, tier: UserTier) -> Self {
        let span = span!(
            Level::INFO,
            "gate.request",
            request_id = request_id,
            user_id = %user_id,
            tier = %tier,
            level = field::Empty,
            model = field::Empty,
            polls = field::Empty,
            outcome = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn record_plan(&self, plan: &ServicePlan, model: &str) {
        self.span.record("level", field::display(plan.level));
        self.span.record("model", model);
    }

    pub fn record_polls(&self, polls: u32) {
        self.span.record("polls", polls);
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn finish(self, outcome: &str) -> f64 {
        let latency_ms = self.elapsed_ms();
        self.span.record("outcome", outcome);
        self.span.record("latency_ms", latency_ms as u64);
        latency_ms
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{ServiceLevel, ModelTier};

    #[test]
    fn test_request_ids_increase() {
        let context = SpanContext::new();
        assert_eq!(context.next_request_id(), 0);
        assert_eq!(context.next_request_id(), 1);
    }

    #[tokio::test]
    async fn test_request_span_records_fields() {
        let context = SpanContext::new();
        let span = context.request_span("alice", UserTier::Premium);
        span.record_plan(
            &ServicePlan {
                level: ServiceLevel::Warning,
                enabled: true,
                max_tokens: 4_000,
                model_tier: ModelTier::Standard,
            },
            "claude-sonnet-4-5",
        );
        span.record_polls(3);
        assert!(span.finish("completed") >= 0.0);
    }
}
