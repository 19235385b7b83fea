//! Completion poller.
//!
//! Drives a submitted [`Job`] to a terminal state by fetching its status at a
//! fixed interval. Status fetches that fail transiently (or exceed the per-call
//! timeout) are retried without consuming a poll, up to a small budget. A job
//! that is still running after `max_polls` fetches is abandoned as timed out;
//! the upstream job is left alone and any late result is discarded.

mod extract;
mod job;

pub use extract::{Citation, extract_artifact, sanitize};
pub use job::{InvalidTransition, Job, JobState};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::provider::{
    AssistantProvider, JobRequest, JobStatus, ProviderError, ProviderMessage, ThreadId, TokenUsage,
    UpstreamJobState,
};
use crate::{Error, Result};

const MESSAGE_PAGE: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub max_polls: u32,
    /// Transient fetch failures tolerated per job before giving up.
    pub transient_retry_budget: u32,
    pub call_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_polls: 90,
            transient_retry_budget: 3,
            call_timeout_ms: 10_000,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub artifact: String,
    pub citations: Vec<Citation>,
    pub usage: TokenUsage,
    pub polls: u32,
    pub elapsed: Duration,
}

pub struct CompletionPoller {
    provider: Arc<dyn AssistantProvider>,
    config: PollerConfig,
}

impl CompletionPoller {
    pub fn new(provider: Arc<dyn AssistantProvider>, config: PollerConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub async fn submit(&self, thread: &ThreadId, request: &JobRequest) -> Result<Job> {
        let handle = self.provider.submit_job(thread, request).await?;
        debug!(thread_id = %thread, job_id = %handle.job_id, model = %request.model, "Job submitted");
        Ok(Job::new(handle))
    }

    pub async fn drive(&self, job: &mut Job) -> Result<Completion> {
        if job.state().is_terminal() {
            return Err(Error::InvalidRequest(format!(
                "job {} is already {}",
                job.handle().job_id,
                job.state()
            )));
        }

        loop {
            let status = match self.fetch_status(job).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    self.absorb_transient(job, &e)?;
                    tokio::time::sleep(self.config.interval()).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let state = job.observe(status.state).map_err(invalid)?;
            debug!(
                job_id = %job.handle().job_id,
                poll = job.polls(),
                state = %state,
                "Polled job status"
            );

            match status.state {
                UpstreamJobState::Completed => return self.complete(job, status).await,
                UpstreamJobState::Failed => {
                    let reason = status
                        .failure_reason
                        .unwrap_or_else(|| "upstream job failed without a reason".to_string());
                    warn!(job_id = %job.handle().job_id, reason = %reason, "Job failed");
                    return Err(Error::UpstreamFailure { reason });
                }
                UpstreamJobState::Queued | UpstreamJobState::InProgress => {
                    if job.polls() >= self.config.max_polls {
                        return Err(self.give_up(job));
                    }
                    tokio::time::sleep(self.config.interval()).await;
                }
            }
        }
    }

    async fn fetch_status(&self, job: &Job) -> std::result::Result<JobStatus, ProviderError> {
        tokio::time::timeout(
            self.config.call_timeout(),
            self.provider.get_job_status(job.handle()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ProviderError::Transient {
                message: format!("status fetch exceeded {:?}", self.config.call_timeout()),
            })
        })
    }

    fn absorb_transient(&self, job: &mut Job, error: &ProviderError) -> Result<()> {
        let failures = job.record_transient_failure();
        if failures > self.config.transient_retry_budget {
            return Err(self.give_up(job));
        }
        debug!(
            job_id = %job.handle().job_id,
            failures,
            error = %error,
            "Retrying status fetch after transient failure"
        );
        Ok(())
    }

    fn give_up(&self, job: &mut Job) -> Error {
        if let Err(e) = job.time_out() {
            return invalid(e);
        }
        let elapsed = job.elapsed();
        warn!(
            job_id = %job.handle().job_id,
            polls = job.polls(),
            transient_failures = job.transient_failures(),
            ?elapsed,
            "Job timed out"
        );
        Error::Timeout {
            elapsed,
            polls: job.polls(),
        }
    }

    async fn complete(&self, job: &mut Job, status: JobStatus) -> Result<Completion> {
        let messages = self.fetch_messages(job).await?;
        let Some((artifact, citations)) = extract_artifact(&messages) else {
            return Err(Error::UpstreamFailure {
                reason: "job completed without an assistant reply".to_string(),
            });
        };

        let completion = Completion {
            artifact,
            citations,
            usage: status.usage.unwrap_or_default(),
            polls: job.polls(),
            elapsed: job.elapsed(),
        };
        info!(
            job_id = %job.handle().job_id,
            polls = completion.polls,
            tokens = completion.usage.total(),
            elapsed = ?completion.elapsed,
            "Job completed"
        );
        Ok(completion)
    }

    // Shares the job's transient budget with status fetches.
    async fn fetch_messages(&self, job: &mut Job) -> Result<Vec<ProviderMessage>> {
        loop {
            let thread = &job.handle().thread_id;
            let fetched = tokio::time::timeout(
                self.config.call_timeout(),
                self.provider.list_messages(thread, MESSAGE_PAGE),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Transient {
                    message: "message listing timed out".to_string(),
                })
            });

            match fetched {
                Ok(messages) => return Ok(messages),
                Err(e) if e.is_transient() => {
                    let failures = job.record_transient_failure();
                    if failures > self.config.transient_retry_budget {
                        let elapsed = job.elapsed();
                        warn!(
                            job_id = %job.handle().job_id,
                            polls = job.polls(),
                            transient_failures = failures,
                            error = %e,
                            ?elapsed,
                            "Reply listing kept failing; giving up"
                        );
                        return Err(Error::Timeout {
                            elapsed,
                            polls: job.polls(),
                        });
                    }
                    tokio::time::sleep(self.config.interval()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn invalid(e: InvalidTransition) -> Error {
    Error::InvalidRequest(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testing::ScriptedProvider;

    fn poller(provider: Arc<ScriptedProvider>) -> CompletionPoller {
        CompletionPoller::new(provider, PollerConfig::default())
    }

    async fn submitted(poller: &CompletionPoller) -> Job {
        poller
            .submit(
                &ThreadId::new("thread_1"),
                &JobRequest {
                    model: "claude-sonnet-4-5".into(),
                    max_output_tokens: 500,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_do_not_consume_polls() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_state(UpstreamJobState::Queued)
                .then_error(ProviderError::Transient {
                    message: "502".into(),
                })
                .then_error(ProviderError::Transient {
                    message: "502".into(),
                }),
        );
        let poller = poller(provider.clone());
        let mut job = submitted(&poller).await;

        let completion = poller.drive(&mut job).await.unwrap();
        assert_eq!(completion.polls, 2);
        assert_eq!(provider.status_calls(), 4);
        assert_eq!(job.transient_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_budget_escalates_to_timeout() {
        let mut provider = ScriptedProvider::new();
        for _ in 0..4 {
            provider = provider.then_error(ProviderError::Transient {
                message: "reset".into(),
            });
        }
        let provider = Arc::new(provider);
        let poller = poller(provider.clone());
        let mut job = submitted(&poller).await;

        let err = poller.drive(&mut job).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { polls: 0, .. }));
        assert_eq!(job.state(), JobState::TimedOut);
        assert_eq!(provider.status_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_listing_retries_within_budget() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_listing_error(ProviderError::Transient {
                    message: "502".into(),
                })
                .then_listing_error(ProviderError::Transient {
                    message: "503".into(),
                }),
        );
        let poller = poller(provider.clone());
        let mut job = submitted(&poller).await;

        let completion = poller.drive(&mut job).await.unwrap();
        assert_eq!(completion.artifact, "Hello from the assistant.");
        assert_eq!(provider.listing_calls(), 3);
        assert_eq!(job.transient_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_listing_budget_escalates_to_timeout() {
        let mut provider = ScriptedProvider::new();
        for _ in 0..4 {
            provider = provider.then_listing_error(ProviderError::Transient {
                message: "message listing timed out".into(),
            });
        }
        let provider = Arc::new(provider);
        let poller = poller(provider.clone());
        let mut job = submitted(&poller).await;

        let err = poller.drive(&mut job).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { polls: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(provider.status_calls(), 1);
        assert_eq!(provider.listing_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_surfaces_reason_verbatim() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_state(UpstreamJobState::InProgress)
                .then_status(JobStatus::failed("server_error: model overloaded")),
        );
        let poller = poller(provider);
        let mut job = submitted(&poller).await;

        match poller.drive(&mut job).await.unwrap_err() {
            Error::UpstreamFailure { reason } => {
                assert_eq!(reason, "server_error: model overloaded");
            }
            other => panic!("expected UpstreamFailure, got {other:?}"),
        }
        assert_eq!(job.state(), JobState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new().then_error(ProviderError::NotFound {
            resource: "run_1".into(),
        }));
        let poller = poller(provider.clone());
        let mut job = submitted(&poller).await;

        let err = poller.drive(&mut job).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::NotFound { .. })));
        assert_eq!(provider.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driving_terminal_job_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new());
        let poller = poller(provider.clone());
        let mut job = submitted(&poller).await;
        poller.drive(&mut job).await.unwrap();

        assert!(matches!(
            poller.drive(&mut job).await,
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(provider.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_are_spaced_by_interval() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_state(UpstreamJobState::Queued)
                .then_state(UpstreamJobState::InProgress),
        );
        let poller = poller(provider);
        let mut job = submitted(&poller).await;

        let completion = poller.drive(&mut job).await.unwrap();
        assert_eq!(completion.polls, 3);
        assert!(completion.elapsed >= Duration::from_secs(2));
    }
}
