//! Job lifecycle.

use std::fmt;

use thiserror::Error;
use tokio::time::Instant;

use crate::provider::{JobHandle, UpstreamJobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl From<UpstreamJobState> for JobState {
    fn from(state: UpstreamJobState) -> Self {
        match state {
            UpstreamJobState::Queued => Self::Queued,
            UpstreamJobState::InProgress => Self::InProgress,
            UpstreamJobState::Completed => Self::Completed,
            UpstreamJobState::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Job already {from}; cannot move to {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// A submitted upstream job. Only the poller moves it between states.
#[derive(Debug)]
pub struct Job {
    handle: JobHandle,
    state: JobState,
    polls: u32,
    transient_failures: u32,
    started: Instant,
}

impl Job {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            state: JobState::Queued,
            polls: 0,
            transient_failures: 0,
            started: Instant::now(),
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Successful status fetches so far.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn transient_failures(&self) -> u32 {
        self.transient_failures
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Applies one fetched upstream status.
    pub(crate) fn observe(&mut self, upstream: UpstreamJobState) -> Result<JobState, InvalidTransition> {
        self.transition(upstream.into())?;
        self.polls += 1;
        Ok(self.state)
    }

    pub(crate) fn record_transient_failure(&mut self) -> u32 {
        self.transient_failures += 1;
        self.transient_failures
    }

    pub(crate) fn time_out(&mut self) -> Result<JobState, InvalidTransition> {
        self.transition(JobState::TimedOut)
    }

    fn transition(&mut self, to: JobState) -> Result<JobState, InvalidTransition> {
        if self.state.is_terminal() {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(to)
    }
}
