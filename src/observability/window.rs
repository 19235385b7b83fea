//! Rolling window of recent request outcomes.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug)]
pub struct RequestWindow {
    span: Duration,
    entries: Mutex<VecDeque<(DateTime<Utc>, bool)>>,
}

impl Default for RequestWindow {
    fn default() -> Self {
        Self::new(Duration::minutes(1))
    }
}

impl RequestWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Window long enough that nothing recorded between two cycles of
    /// `period` ages out before the later one samples it. Never shorter than
    /// a minute.
    pub fn covering(period: std::time::Duration) -> Self {
        let span = Duration::from_std(period).unwrap_or(Duration::MAX);
        Self::new(span.max(Duration::minutes(1)))
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    pub fn record(&self, at: DateTime<Utc>, success: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back((at, success));
        Self::evict(&mut entries, at, self.span);
    }

    fn evict(entries: &mut VecDeque<(DateTime<Utc>, bool)>, now: DateTime<Utc>, span: Duration) {
        while let Some((at, _)) = entries.front()
            && now - *at >= span
        {
            entries.pop_front();
        }
    }

    /// `(requests, errors)` inside the window ending at `now`.
    pub fn counts(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut entries, now, self.span);
        let errors = entries.iter().filter(|(_, ok)| !ok).count();
        (entries.len(), errors)
    }

    pub fn requests_per_minute(&self, now: DateTime<Utc>) -> f64 {
        let (requests, _) = self.counts(now);
        let minutes = self.span.num_milliseconds() as f64 / 60_000.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        requests as f64 / minutes
    }

    /// Fraction of failed requests in the window; zero when idle.
    pub fn error_rate(&self, now: DateTime<Utc>) -> f64 {
        match self.counts(now) {
            (0, _) => 0.0,
            (requests, errors) => errors as f64 / requests as f64,
        }
    }
}
