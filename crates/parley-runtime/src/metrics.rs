//! In-memory metrics backend.
//!
//! [`MetricsRecorder`] implements the core [`Metrics`] capability on top of
//! the `metrics` facade. Measurements go through `counter!`, `histogram!`
//! and `gauge!` against a recorder owned by this instance rather than the
//! process-global one, so several runtimes (and tests) never share series.
//! [`MetricsRecorder::snapshot`] reads the recorder back into plain maps.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use ::metrics::{Key, Label};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use parking_lot::RwLock;
use serde::Serialize;

use parley_core::{Metrics, Tags};

/// Aggregate of the timing samples in one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingSummary {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl TimingSummary {
    fn from_samples(samples: impl IntoIterator<Item = f64>) -> Option<Self> {
        samples.into_iter().fold(None, |summary, ms| {
            Some(match summary {
                None => Self {
                    count: 1,
                    total_ms: ms,
                    min_ms: ms,
                    max_ms: ms,
                },
                Some(s) => Self {
                    count: s.count + 1,
                    total_ms: s.total_ms + ms,
                    min_ms: s.min_ms.min(ms),
                    max_ms: s.max_ms.max(ms),
                },
            })
        })
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// Point-in-time copy of everything recorded, keyed by series.
///
/// Series keys read `name{tag=value,...}`, or just `name` without tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, TimingSummary>,
    pub gauges: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, series: &str) -> u64 {
        self.counters.get(series).copied().unwrap_or(0)
    }

    /// Sums a counter across every tag combination.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|(series, _)| series_name(series) == name)
            .map(|(_, value)| value)
            .sum()
    }
}

/// Counters and gauges keep their value across snapshots. Histogram
/// samples are drained by the debugging recorder, so `timings` covers what
/// was recorded since the previous snapshot.
pub struct MetricsRecorder {
    recorder: RwLock<DebuggingRecorder>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            recorder: RwLock::new(DebuggingRecorder::new()),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let entries = self.recorder.read().snapshotter().snapshot().into_vec();

        let mut snapshot = MetricsSnapshot::default();
        for (composite, _unit, _description, value) in entries {
            let series = series_key(composite.key());
            match value {
                DebugValue::Counter(count) => {
                    snapshot.counters.insert(series, count);
                }
                DebugValue::Gauge(value) => {
                    snapshot.gauges.insert(series, value.into_inner());
                }
                DebugValue::Histogram(samples) => {
                    let samples = samples.into_iter().map(|ms| ms.into_inner());
                    if let Some(summary) = TimingSummary::from_samples(samples) {
                        snapshot.timings.insert(series, summary);
                    }
                }
            }
        }
        snapshot
    }

    /// Drops every series.
    pub fn reset(&self) {
        *self.recorder.write() = DebuggingRecorder::new();
    }

    fn record(&self, f: impl FnOnce()) {
        let recorder = self.recorder.read();
        ::metrics::with_local_recorder(&*recorder, f);
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRecorder").finish_non_exhaustive()
    }
}

impl Metrics for MetricsRecorder {
    fn increment(&self, name: &str, tags: Tags<'_>) {
        self.record(|| ::metrics::counter!(name.to_owned(), labels(tags)).increment(1));
    }

    fn timing(&self, name: &str, duration: Duration, tags: Tags<'_>) {
        let ms = duration.as_micros() as f64 / 1000.0;
        self.record(|| ::metrics::histogram!(name.to_owned(), labels(tags)).record(ms));
    }

    fn gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        self.record(|| ::metrics::gauge!(name.to_owned(), labels(tags)).set(value));
    }
}

fn labels(tags: Tags<'_>) -> Vec<Label> {
    tags.iter()
        .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
        .collect()
}

fn series_key(key: &Key) -> String {
    let mut labels: Vec<String> = key
        .labels()
        .map(|label| format!("{}={}", label.key(), label.value()))
        .collect();
    if labels.is_empty() {
        return key.name().to_string();
    }
    labels.sort_unstable();
    format!("{}{{{}}}", key.name(), labels.join(","))
}

fn series_name(series: &str) -> &str {
    series.split_once('{').map_or(series, |(name, _)| name)
}
