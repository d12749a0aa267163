//! The metrics capability consumed by middlewares and the event bus.

use std::time::Duration;

/// Key/value tags attached to a measurement.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// A sink for counters, timings and gauges.
///
/// The concrete backend lives outside the core; see `parley-runtime` for a
/// recorder that aggregates in memory and reports through `tracing`.
pub trait Metrics: Send + Sync {
    fn increment(&self, name: &str, tags: Tags<'_>);

    fn timing(&self, name: &str, duration: Duration, tags: Tags<'_>);

    fn gauge(&self, name: &str, value: f64, tags: Tags<'_>);
}

/// Discards every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment(&self, _name: &str, _tags: Tags<'_>) {}

    fn timing(&self, _name: &str, _duration: Duration, _tags: Tags<'_>) {}

    fn gauge(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
}
