//! Caller-facing request path.
//!
//! [`Gateway::submit_message`] runs one request end to end: rate limit,
//! budget-derived service level, conversation lookup, job submission under a
//! concurrency permit, polling, and usage accounting. The capacity controller
//! runs beside it and only resizes the permit pool.

mod signals;

pub use signals::GatewaySignals;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::budget::{
    BudgetMonitor, PricingTable, ServiceLevel, ServiceLevelTable, UserTier, select_service_level,
};
use crate::capacity::{CapacityController, ConcurrencyLimit, ConcurrencyPermit, SignalSource};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, GateConfig};
use crate::observability::{MetricsRegistry, RequestSpan, RequestWindow, SpanContext};
use crate::poller::{Citation, CompletionPoller, Job};
use crate::provider::{AssistantProvider, JobRequest, ThreadId, TokenUsage};
use crate::quota::{QuotaUsage, RateLimiter, local_day};
use crate::session::{ConversationHandle, HistoryEntry, ThreadRegistry};
use crate::store::{RetryingStore, Store, StoreKey};
use crate::{Error, ErrorKind, Result};

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Answer to a served request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub artifact: String,
    pub citations: Vec<Citation>,
    pub tokens_used: TokenUsage,
    pub cost_usd: Decimal,
    pub level: ServiceLevel,
    pub model: String,
    pub thread_id: ThreadId,
    pub polls: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub level: ServiceLevel,
    pub utilization: f64,
    pub accrued_usd: Decimal,
    pub ceiling_usd: Decimal,
    pub concurrency_ceiling: u32,
}

pub struct Gateway {
    config: GateConfig,
    store: Arc<dyn Store>,
    provider: Arc<dyn AssistantProvider>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    budget: BudgetMonitor,
    levels: ServiceLevelTable,
    registry: ThreadRegistry,
    poller: CompletionPoller,
    limit: ConcurrencyLimit,
    acquire_timeout: Duration,
    metrics: MetricsRegistry,
    window: Arc<RequestWindow>,
    spans: SpanContext,
    last_level: Mutex<Option<ServiceLevel>>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn budget(&self) -> &BudgetMonitor {
        &self.budget
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn concurrency_limit(&self) -> &ConcurrencyLimit {
        &self.limit
    }

    /// Serves one user message and returns the assistant's sanitized reply.
    pub async fn submit_message(
        &self,
        user_id: &str,
        text: &str,
        tier: UserTier,
    ) -> Result<Reply> {
        let span = self.spans.request_span(user_id, tier);
        self.metrics.record_request_start();

        let result = self
            .serve(user_id, text, tier, &span)
            .instrument(span.span().clone())
            .await;

        let kind = result.as_ref().err().map(Error::kind);
        // Denied and malformed requests never reached the upstream.
        if !matches!(&result, Err(e) if e.is_admission_denial() || e.kind() == ErrorKind::InvalidRequest)
        {
            self.window.record(self.clock.now(), result.is_ok());
        }

        let outcome = kind.map_or("completed", |k| k.as_str());
        let latency_ms = span.finish(outcome);
        self.metrics.record_request_end(kind, latency_ms);
        result
    }

    async fn serve(
        &self,
        user_id: &str,
        text: &str,
        tier: UserTier,
        span: &RequestSpan,
    ) -> Result<Reply> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidRequest("user id is empty".to_string()));
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidRequest("message text is empty".to_string()));
        }

        let now = self.clock.now();
        let remaining_tokens = self.limiter.admit(user_id, now).await?;

        let utilization = self.budget.current_utilization(now).await?;
        let plan = select_service_level(utilization, tier, &self.levels);
        self.note_level(plan.level, utilization);
        let model = self.config.models.name_for(plan.model_tier).to_string();
        span.record_plan(&plan, &model);

        if plan.level == ServiceLevel::Shutoff {
            warn!(user_id = %user_id, utilization, "Request refused: budget exhausted");
            return Err(Error::Shutoff { utilization });
        }
        if !plan.enabled {
            warn!(user_id = %user_id, level = %plan.level, tier = %tier, "Request refused for tier");
            return Err(Error::BudgetExhausted {
                level: plan.level,
                tier,
            });
        }

        let permit = self.acquire_permit().await?;
        // Never let one reply run past the user's daily cap.
        let max_output_tokens =
            u32::try_from(remaining_tokens).map_or(plan.max_tokens, |left| plan.max_tokens.min(left));
        let request = JobRequest {
            model: model.clone(),
            max_output_tokens,
        };
        let (handle, mut job) = self.start_job(user_id, text, &request, now).await?;
        let completion = self.poller.drive(&mut job).await;
        span.record_polls(job.polls());
        drop(permit);
        let completion = completion?;

        let finished = self.clock.now();
        let usage = completion.usage;
        let entry = self
            .budget
            .record_usage(user_id, usage.input_tokens, usage.output_tokens, &model, finished)
            .await?;
        self.metrics
            .record_job(completion.polls, usage.input_tokens, usage.output_tokens);
        self.metrics.record_cost(entry.cost);
        self.record_tokens(user_id, usage.total(), finished).await;
        self.record_history(user_id, text, &completion.artifact, now, finished)
            .await;

        Ok(Reply {
            artifact: completion.artifact,
            citations: completion.citations,
            tokens_used: usage,
            cost_usd: entry.cost,
            level: plan.level,
            model,
            thread_id: handle.external_thread_id,
            polls: completion.polls,
        })
    }

    async fn acquire_permit(&self) -> Result<ConcurrencyPermit> {
        match tokio::time::timeout(self.acquire_timeout, self.limit.acquire()).await {
            Ok(Ok(permit)) => {
                self.metrics
                    .concurrency_ceiling
                    .set(i64::from(self.limit.ceiling()));
                Ok(permit)
            }
            Ok(Err(_)) => Err(Error::InvalidRequest(
                "concurrency limit has been closed".to_string(),
            )),
            Err(_) => {
                warn!(
                    ceiling = self.limit.ceiling(),
                    timeout = ?self.acquire_timeout,
                    "Gave up waiting for a concurrency slot"
                );
                Err(Error::Timeout {
                    elapsed: self.acquire_timeout,
                    polls: 0,
                })
            }
        }
    }

    /// Posts the message and submits the job, swapping in a fresh conversation
    /// once if the upstream no longer knows the stored one.
    async fn start_job(
        &self,
        user_id: &str,
        text: &str,
        request: &JobRequest,
        now: DateTime<Utc>,
    ) -> Result<(ConversationHandle, Job)> {
        let mut handle = self.registry.resolve(user_id, now).await?;
        let mut replaced = false;

        loop {
            match self.post(&handle.external_thread_id, text, request).await {
                Ok(job) => return Ok((handle, job)),
                Err(Error::Provider(e)) if e.is_not_found() && !replaced => {
                    handle = self
                        .registry
                        .replace_stale(user_id, &handle.external_thread_id, now)
                        .await?;
                    self.metrics.stale_threads_replaced.inc();
                    replaced = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post(&self, thread: &ThreadId, text: &str, request: &JobRequest) -> Result<Job> {
        self.provider.append_message(thread, text).await?;
        self.poller.submit(thread, request).await
    }

    // Accounting after the budget ledger is best effort; the ledger is what
    // the service level reads.
    async fn record_tokens(&self, user_id: &str, tokens: u64, now: DateTime<Utc>) {
        if let Err(e) = self.limiter.record_tokens(user_id, tokens, now).await {
            warn!(user_id = %user_id, tokens, error = %e, "Failed to record daily tokens");
        }

        let day = local_day(now, self.config.rate_limit.offset());
        let delta = i64::try_from(tokens).unwrap_or(i64::MAX);
        if let Err(e) = self.store.increment(&StoreKey::DailyTokens(day), delta).await {
            warn!(tokens, error = %e, "Failed to record aggregate daily tokens");
        }
    }

    async fn record_history(
        &self,
        user_id: &str,
        text: &str,
        reply: &str,
        asked_at: DateTime<Utc>,
        answered_at: DateTime<Utc>,
    ) {
        for entry in [
            HistoryEntry::user(text, asked_at),
            HistoryEntry::assistant(reply, answered_at),
        ] {
            if let Err(e) = self.registry.record_exchange(user_id, entry).await {
                warn!(user_id = %user_id, error = %e, "Failed to record history");
                return;
            }
        }
    }

    fn note_level(&self, level: ServiceLevel, utilization: f64) {
        let mut last = self.last_level.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(previous) if previous != level => {
                info!(%previous, %level, utilization, "Service level changed");
            }
            None => debug!(%level, utilization, "Initial service level"),
            _ => {}
        }
        *last = Some(level);
    }

    /// Starts a new conversation for `user_id` and queues the old one for
    /// purging.
    pub async fn reset_conversation(&self, user_id: &str) -> Result<ThreadId> {
        let handle = self.registry.reset(user_id, self.clock.now()).await?;
        Ok(handle.external_thread_id)
    }

    pub async fn service_status(&self) -> Result<ServiceStatus> {
        let snapshot = self.budget.snapshot(self.clock.now()).await?;
        let ceiling = self.limit.ceiling();
        self.metrics.concurrency_ceiling.set(i64::from(ceiling));

        Ok(ServiceStatus {
            level: self.levels.level_for(snapshot.utilization),
            utilization: snapshot.utilization,
            accrued_usd: snapshot.accrued_usd,
            ceiling_usd: snapshot.ceiling_usd,
            concurrency_ceiling: ceiling,
        })
    }

    pub async fn quota_usage(&self, user_id: &str) -> Result<QuotaUsage> {
        self.limiter.usage(user_id, self.clock.now()).await
    }

    pub async fn history(&self, user_id: &str) -> Result<Vec<HistoryEntry>> {
        self.registry.history(user_id).await
    }

    /// Controller bound to this gateway's concurrency limit.
    pub fn capacity_controller(&self) -> CapacityController {
        CapacityController::new(self.config.capacity.clone(), self.limit.clone())
    }

    pub fn signals(&self) -> GatewaySignals {
        GatewaySignals::new(
            self.store.clone(),
            self.window.clone(),
            self.clock.clone(),
            self.config.rate_limit.offset(),
            self.config.capacity.daily_token_budget,
        )
    }

    /// Runs the capacity controller on the current runtime until `shutdown`.
    pub fn spawn_capacity_controller(
        &self,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let controller = self.capacity_controller();
        let signals: Arc<dyn SignalSource> = Arc::new(self.signals());
        tokio::spawn(async move { controller.run(signals, shutdown).await })
    }
}

#[derive(Default)]
pub struct GatewayBuilder {
    config: Option<GateConfig>,
    store: Option<Arc<dyn Store>>,
    provider: Option<Arc<dyn AssistantProvider>>,
    clock: Option<Arc<dyn Clock>>,
    pricing: Option<PricingTable>,
    acquire_timeout: Option<Duration>,
}

impl GatewayBuilder {
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn AssistantProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// How long a request waits for a concurrency slot before timing out.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let backend = self.store.ok_or_else(|| missing("store"))?;
        let provider = self.provider.ok_or_else(|| missing("provider"))?;
        let store: Arc<dyn Store> =
            Arc::new(RetryingStore::new(backend, config.store.retry_policy()));

        let budget = BudgetMonitor::new(store.clone(), config.monthly_budget_ceiling_usd)
            .with_pricing(self.pricing.unwrap_or_default());
        let limit = ConcurrencyLimit::new(config.capacity.initial_ceiling);
        let metrics = MetricsRegistry::new();
        metrics
            .concurrency_ceiling
            .set(i64::from(config.capacity.initial_ceiling));

        debug!(
            store = store.name(),
            provider = provider.name(),
            ceiling_usd = %config.monthly_budget_ceiling_usd,
            "Gateway built"
        );

        Ok(Gateway {
            limiter: RateLimiter::new(store.clone(), config.rate_limit.clone()),
            budget,
            levels: ServiceLevelTable::new(config.thresholds, config.tiers, config.degraded),
            registry: ThreadRegistry::new(store.clone(), provider.clone()),
            poller: CompletionPoller::new(provider.clone(), config.poller.clone()),
            limit,
            acquire_timeout: self.acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
            metrics,
            window: Arc::new(RequestWindow::covering(config.capacity.period())),
            spans: SpanContext::new(),
            last_level: Mutex::new(None),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            store,
            provider,
            config,
        })
    }
}

fn missing(what: &str) -> Error {
    Error::Config(ConfigError::InvalidValue {
        key: what.to_string(),
        message: "required to build a gateway".to_string(),
    })
}
