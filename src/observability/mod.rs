//! Local metrics, request spans and the rolling request window.
//!
//! Metrics are plain atomics read in-process; the [`RequestWindow`] is what
//! the capacity controller samples for requests/minute and error rate.

mod metrics;
mod spans;
mod window;

pub use metrics::{Counter, Gauge, Histogram, MetricsRegistry, MetricsSummary};
pub use spans::{RequestSpan, SpanContext};
pub use window::RequestWindow;
