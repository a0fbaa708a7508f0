//! Metric emission hooks.
//!
//! Components emit counters, gauges, and histograms through a
//! pluggable [`MetricSink`]; deployments pick the sink, tests capture
//! with [`MemorySink`]. Label sets are static name lists with
//! bounded-cardinality values (statuses, skill ids, error kinds).
//!
//! With the `metrics` feature enabled, [`FacadeSink`] forwards into
//! the `metrics` crate so any installed recorder (Prometheus exporter,
//! statsd bridge) sees the same series.

use std::sync::{Arc, Mutex};

use tracing::debug;

/// Metric names emitted by the orchestrator.
pub mod names {
    pub const RUNS_STARTED: &str = "runs_started_total";
    pub const RUNS_COMPLETED: &str = "runs_completed_total";
    pub const STEP_DURATION_SECONDS: &str = "step_duration_seconds";
    pub const STEP_RETRIES: &str = "step_retries_total";
    pub const CHECKPOINT_SAVE_SECONDS: &str = "checkpoint_save_seconds";
    pub const REPLAY_MISMATCHES: &str = "replay_mismatches_total";
    pub const GOLDEN_TAMPER: &str = "golden_tamper_total";
    pub const POLICY_DENIALS: &str = "policy_denials_total";
    pub const CLAIM_CONFLICTS: &str = "claim_conflicts_total";
    pub const INBOX_TIMEOUTS: &str = "inbox_timeouts_total";
}

/// Label pairs attached to a sample. Names are static; values must be
/// bounded-cardinality.
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Abstraction over a metrics backend.
pub trait MetricSink: Send + Sync {
    fn counter(&self, name: &'static str, labels: Labels<'_>, value: u64);
    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Discards everything.
#[derive(Default)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn counter(&self, _name: &'static str, _labels: Labels<'_>, _value: u64) {}
    fn gauge(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
    fn histogram(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
}

/// Emits samples as `tracing` debug events; useful during development.
#[derive(Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        debug!(metric = name, ?labels, value, kind = "counter");
    }
    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        debug!(metric = name, ?labels, value, kind = "gauge");
    }
    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        debug!(metric = name, ?labels, value, kind = "histogram");
    }
}

/// One captured sample.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
    pub kind: SampleKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleKind {
    Counter,
    Gauge,
    Histogram,
}

/// Captures samples for test assertions.
#[derive(Clone, Default)]
pub struct MemorySink {
    samples: Arc<Mutex<Vec<MetricSample>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of everything captured so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.lock().clone()
    }

    /// Sum of counter increments for a name, across label sets.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.lock()
            .iter()
            .filter(|s| s.kind == SampleKind::Counter && s.name == name)
            .map(|s| s.value as u64)
            .sum()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MetricSample>> {
        match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, name: &'static str, labels: Labels<'_>, value: f64, kind: SampleKind) {
        self.lock().push(MetricSample {
            name,
            labels: labels.iter().map(|(k, v)| (*k, (*v).to_string())).collect(),
            value,
            kind,
        });
    }
}

impl MetricSink for MemorySink {
    fn counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        self.push(name, labels, value as f64, SampleKind::Counter);
    }
    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.push(name, labels, value, SampleKind::Gauge);
    }
    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.push(name, labels, value, SampleKind::Histogram);
    }
}

/// Forwards into the `metrics` crate facade.
#[cfg(feature = "metrics")]
#[derive(Default)]
pub struct FacadeSink;

#[cfg(feature = "metrics")]
impl MetricSink for FacadeSink {
    fn counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        let labels: Vec<metrics::Label> = labels
            .iter()
            .map(|(k, v)| metrics::Label::new(*k, (*v).to_string()))
            .collect();
        metrics::counter!(name, labels).increment(value);
    }
    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let labels: Vec<metrics::Label> = labels
            .iter()
            .map(|(k, v)| metrics::Label::new(*k, (*v).to_string()))
            .collect();
        metrics::gauge!(name, labels).set(value);
    }
    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let labels: Vec<metrics::Label> = labels
            .iter()
            .map(|(k, v)| metrics::Label::new(*k, (*v).to_string()))
            .collect();
        metrics::histogram!(name, labels).record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_accumulates_counters() {
        let sink = MemorySink::new();
        sink.counter(names::RUNS_STARTED, &[("status", "completed")], 1);
        sink.counter(names::RUNS_STARTED, &[("status", "failed")], 2);
        assert_eq!(sink.counter_total(names::RUNS_STARTED), 3);
        assert_eq!(sink.snapshot().len(), 2);
    }
}
