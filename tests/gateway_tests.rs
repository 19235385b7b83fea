//! Gateway Tests
//!
//! End-to-end request handling over the in-memory store and the scripted
//! provider.
//!
//! Run: cargo nextest run --test gateway_tests

use std::sync::Arc;
use std::time::Duration;

use assistant_gate::budget::{BillingPeriod, ServiceLevel, UserTier};
use assistant_gate::capacity::SignalSource;
use assistant_gate::clock::ManualClock;
use assistant_gate::config::GateConfig;
use assistant_gate::gateway::Gateway;
use assistant_gate::provider::{Annotation, JobStatus, MessageRole, ThreadId};
use assistant_gate::store::{MemoryStore, Store, StoreKey};
use assistant_gate::testing::ScriptedProvider;
use assistant_gate::{Error, ErrorKind};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
}

struct Harness {
    gateway: Gateway,
    store: Arc<MemoryStore>,
    provider: Arc<ScriptedProvider>,
    clock: Arc<ManualClock>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(config: GateConfig, provider: ScriptedProvider) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(provider);
    let clock = Arc::new(ManualClock::new(now()));
    let gateway = Gateway::builder()
        .config(config)
        .store(store.clone())
        .provider(provider.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        gateway,
        store,
        provider,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(GateConfig::default(), ScriptedProvider::new())
}

/// Seeds the current period's accrued cost, in dollars.
async fn spend(store: &MemoryStore, dollars: i64) {
    let period = BillingPeriod::containing(now());
    store
        .increment(&StoreKey::Budget(period.id), dollars * 1_000_000)
        .await
        .unwrap();
}

// =============================================================================
// Request Path
// =============================================================================

mod request_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_records_everything() {
        let h = harness();

        let reply = h
            .gateway
            .submit_message("alice", "How do refunds work?", UserTier::Free)
            .await
            .unwrap();

        assert_eq!(reply.artifact, "Hello from the assistant.");
        assert_eq!(reply.level, ServiceLevel::Normal);
        assert_eq!(reply.model, "claude-sonnet-4-5");
        assert_eq!(reply.tokens_used.total(), 150);
        // sonnet: 100 in at $3/Mtok + 50 out at $15/Mtok
        assert_eq!(reply.cost_usd, dec!(0.00105));

        let submitted = h.provider.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1.max_output_tokens, 1_500);
        assert_eq!(h.provider.appended()[0].1, "How do refunds work?");

        let status = h.gateway.service_status().await.unwrap();
        assert_eq!(status.accrued_usd, dec!(0.00105));
        assert_eq!(status.level, ServiceLevel::Normal);

        let usage = h.gateway.quota_usage("alice").await.unwrap();
        assert_eq!(usage.requests_in_window, 1);
        assert_eq!(usage.daily_tokens_used, 150);

        let history = h.gateway.history("alice").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].text, "Hello from the assistant.");

        let summary = h.gateway.metrics().summary();
        assert_eq!(summary.completed_requests, 1);
        assert_eq!(summary.total_cost_usd, dec!(0.00105));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_reuses_conversation() {
        let h = harness();
        let first = h
            .gateway
            .submit_message("alice", "one", UserTier::Free)
            .await
            .unwrap();
        let second = h
            .gateway
            .submit_message("alice", "two", UserTier::Free)
            .await
            .unwrap();

        assert_eq!(first.thread_id, second.thread_id);
        assert_eq!(h.provider.threads_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_markers_are_stripped_into_citations() {
        let provider = ScriptedProvider::new().reply_with_annotations(
            "Refunds take five days【4:0†policy.pdf】.",
            vec![Annotation {
                marker: "【4:0†policy.pdf】".into(),
                source: Some("file_9".into()),
                quote: None,
            }],
        );
        let h = harness_with(GateConfig::default(), provider);

        let reply = h
            .gateway
            .submit_message("alice", "refunds?", UserTier::Free)
            .await
            .unwrap();

        assert_eq!(reply.artifact, "Refunds take five days.");
        assert_eq!(reply.citations.len(), 1);
        assert_eq!(reply.citations[0].source.as_deref(), Some("file_9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_conversation_is_replaced_once() {
        let h = harness();
        let first = h
            .gateway
            .submit_message("alice", "one", UserTier::Free)
            .await
            .unwrap();

        h.provider.forget_thread(&first.thread_id);
        let second = h
            .gateway
            .submit_message("alice", "two", UserTier::Free)
            .await
            .unwrap();

        assert_ne!(second.thread_id, first.thread_id);
        assert_eq!(h.provider.threads_created(), 2);
        assert_eq!(h.gateway.metrics().stale_threads_replaced.get(), 1);
        let stored = h.gateway.registry().current("alice").await.unwrap().unwrap();
        assert_eq!(stored.external_thread_id, second.thread_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_is_not_charged() {
        let provider = ScriptedProvider::new().then_status(JobStatus::failed("model overloaded"));
        let h = harness_with(GateConfig::default(), provider);

        let err = h
            .gateway
            .submit_message("alice", "hi", UserTier::Premium)
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::UpstreamFailure { reason } if reason == "model overloaded"));
        assert_eq!(h.gateway.service_status().await.unwrap().accrued_usd, dec!(0));
        assert_eq!(h.gateway.metrics().upstream_failures.get(), 1);
    }
}

// =============================================================================
// Admission
// =============================================================================

mod admission_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_denies_before_upstream() {
        let mut config = GateConfig::default();
        config.rate_limit.max_requests = 2;
        let h = harness_with(config, ScriptedProvider::new());

        for _ in 0..2 {
            h.gateway
                .submit_message("alice", "hi", UserTier::Free)
                .await
                .unwrap();
        }
        let err = h
            .gateway
            .submit_message("alice", "hi", UserTier::Free)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.is_admission_denial());
        assert_eq!(h.provider.submitted().len(), 2);
        assert_eq!(h.gateway.metrics().denied_rate_limited.get(), 1);

        h.clock.advance(chrono::Duration::seconds(60));
        assert_ok!(
            h.gateway
                .submit_message("alice", "hi", UserTier::Free)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_allowance_shrinks_to_daily_remainder() {
        let mut config = GateConfig::default();
        config.rate_limit.daily_token_cap = 200;
        let h = harness_with(config, ScriptedProvider::new());

        // Each scripted reply consumes 150 tokens.
        h.gateway
            .submit_message("alice", "one", UserTier::Premium)
            .await
            .unwrap();
        h.gateway
            .submit_message("alice", "two", UserTier::Premium)
            .await
            .unwrap();
        let submitted = h.provider.submitted();
        assert_eq!(submitted[0].1.max_output_tokens, 200);
        assert_eq!(submitted[1].1.max_output_tokens, 50);

        let err = assert_err!(
            h.gateway
                .submit_message("alice", "three", UserTier::Premium)
                .await
        );
        assert_eq!(err.kind(), ErrorKind::DailyCapReached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutoff_serves_nobody() {
        let h = harness();
        spend(&h.store, 500).await;

        for tier in [UserTier::Free, UserTier::Premium] {
            let err = h
                .gateway
                .submit_message("alice", "hi", tier)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Shutoff { utilization } if utilization >= 1.0));
        }
        assert_eq!(h.provider.threads_created(), 0);
        assert_eq!(
            h.gateway.service_status().await.unwrap().level,
            ServiceLevel::Shutoff
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_serves_premium_on_economy_model() {
        let h = harness();
        spend(&h.store, 485).await;

        let err = h
            .gateway
            .submit_message("free-user", "hi", UserTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BudgetExhausted {
                level: ServiceLevel::Emergency,
                tier: UserTier::Free
            }
        ));

        let reply = h
            .gateway
            .submit_message("premium-user", "hi", UserTier::Premium)
            .await
            .unwrap();
        assert_eq!(reply.level, ServiceLevel::Emergency);
        assert_eq!(reply.model, "claude-haiku-4-5");
        assert_eq!(h.provider.submitted()[0].1.max_output_tokens, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_concurrency_times_out_waiting() {
        let mut config = GateConfig::default();
        config.capacity.min_ceiling = 1;
        config.capacity.initial_ceiling = 1;
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::builder()
            .config(config)
            .store(store)
            .provider(Arc::new(ScriptedProvider::new()))
            .clock(Arc::new(ManualClock::new(now())))
            .acquire_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let _held = gateway.concurrency_limit().try_acquire().unwrap();
        let err = assert_err!(
            gateway
                .submit_message("alice", "hi", UserTier::Free)
                .await
        );
        assert!(matches!(err, Error::Timeout { polls: 0, .. }));
    }
}

// =============================================================================
// Conversation Reset & Status
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reset_starts_fresh_conversation() {
        let h = harness();
        let reply = h
            .gateway
            .submit_message("alice", "hi", UserTier::Free)
            .await
            .unwrap();

        let fresh = h.gateway.reset_conversation("alice").await.unwrap();

        assert_ne!(fresh, reply.thread_id);
        assert!(h.gateway.history("alice").await.unwrap().is_empty());
        let purges = h.gateway.registry().pending_purges().await.unwrap();
        assert_eq!(purges.len(), 1);
        assert_eq!(purges[0].thread_id, reply.thread_id);

        let next = h
            .gateway
            .submit_message("alice", "again", UserTier::Free)
            .await
            .unwrap();
        assert_eq!(next.thread_id, fresh);
    }

    #[tokio::test]
    async fn test_reset_for_unknown_user() {
        let h = harness();
        let thread = h.gateway.reset_conversation("bob").await.unwrap();
        assert_eq!(thread, ThreadId::new("thread_1"));
        assert!(h.gateway.registry().pending_purges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_service_status_reports_levels() {
        let h = harness();
        spend(&h.store, 360).await;

        let status = h.gateway.service_status().await.unwrap();
        assert_eq!(status.level, ServiceLevel::Warning);
        assert!((status.utilization - 0.72).abs() < 1e-9);
        assert_eq!(status.ceiling_usd, dec!(500));
        assert_eq!(status.concurrency_ceiling, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_spike_is_seen_by_the_next_cycle() {
        let mut provider = ScriptedProvider::new();
        for _ in 0..5 {
            provider = provider.then_status(JobStatus::failed("server_error"));
        }
        let h = harness_with(GateConfig::default(), provider);

        for _ in 0..5 {
            let err = assert_err!(
                h.gateway
                    .submit_message("alice", "hi", UserTier::Free)
                    .await
            );
            assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
        }

        // The spike is over well before the next ten-minute cycle.
        h.clock.advance(chrono::Duration::minutes(2));
        let signals = h.gateway.signals().sample().await.unwrap();
        assert_eq!(signals.error_rate, 1.0);

        let decision = h
            .gateway
            .capacity_controller()
            .tick(&h.gateway.signals())
            .await
            .unwrap();
        assert!(decision.forced);
        assert_eq!(decision.ceiling, 32);
        assert_eq!(h.gateway.concurrency_limit().ceiling(), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_reflect_served_traffic() {
        let h = harness();
        h.gateway
            .submit_message("alice", "hi", UserTier::Free)
            .await
            .unwrap();

        let signals = h.gateway.signals().sample().await.unwrap();
        assert_eq!(signals.daily_tokens_used, 150);
        // One request spread over the ten-minute capacity period.
        assert_eq!(signals.requests_per_minute, 0.1);
        assert_eq!(signals.error_rate, 0.0);
        assert_eq!(signals.local_hour, 12);

        let decision = h.gateway.capacity_controller().tick(&h.gateway.signals()).await.unwrap();
        assert_eq!(decision.ceiling, h.gateway.concurrency_limit().ceiling());
    }
}
