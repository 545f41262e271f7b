//! Metric producers: condition-gated, dimension-sliced bucket aggregation.
//!
//! Each producer keeps all of its state behind one mutex. Detector calls and
//! synchronous pulls happen while it is held, so neither may call back into
//! the producer.

pub mod gauge;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::anomaly::AnomalyTracker;
use crate::bucket::{BucketEngine, FlushOutcome, Strategy};
use crate::config::{AlertConfig, MetricConfig, MetricKind};
use crate::dimension::DimensionKey;
use crate::health::HealthMetrics;
use crate::puller::{PullDataReceiver, Puller};
use crate::report::MetricReport;
use crate::sample::Sample;

pub use gauge::{GaugeField, GaugeProducer, SnapshotStrategy};
pub use value::{DeltaStrategy, ValueInterval, ValueProducer};

/// Gating state of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    /// No condition configured; always accumulating.
    Unconditioned,
    True,
    False,
}

impl ConditionState {
    fn initial(metric: &MetricConfig) -> Self {
        if metric.condition.is_some() {
            Self::False
        } else {
            Self::Unconditioned
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Self::False)
    }
}

/// Reason label for dropped samples.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DropReason {
    Late,
    Malformed,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Late => "late",
            Self::Malformed => "malformed",
        }
    }
}

/// State shared by both producer kinds, guarded by the producer mutex.
pub(crate) struct ProducerState<S: Strategy> {
    pub metric_id: i64,
    label: String,
    pub engine: BucketEngine<S>,
    pub condition: ConditionState,
    trackers: Vec<Arc<AnomalyTracker>>,
    report_start_ns: u64,
    pub finished: bool,
    health: Arc<HealthMetrics>,
}

impl<S: Strategy> ProducerState<S> {
    pub fn new(
        metric: &MetricConfig,
        strategy: S,
        start_ns: u64,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let engine = BucketEngine::new(strategy, start_ns, metric.bucket_size_ns())?;

        Ok(Self {
            metric_id: metric.id,
            label: metric.id.to_string(),
            engine,
            condition: ConditionState::initial(metric),
            trackers: Vec::new(),
            report_start_ns: start_ns,
            finished: false,
            health,
        })
    }

    /// Open state survives a boundary while the condition holds, so the next
    /// reading, pulled or pushed, closes it.
    fn carry_open(&self) -> bool {
        self.condition.is_active()
    }

    pub fn flush_if_needed(&mut self, now_ns: u64) {
        let carry = self.carry_open();
        if let Some(outcome) = self.engine.flush_if_needed(now_ns, carry) {
            self.record_flush(&outcome);
        }
    }

    pub fn force_flush(&mut self) {
        let outcome = self.engine.force_flush(false);
        self.record_flush(&outcome);
    }

    fn record_flush(&self, outcome: &FlushOutcome) {
        for tracker in &self.trackers {
            for (key, value) in &outcome.anomaly_values {
                if let Err(e) = tracker.add_past_bucket(key, *value, outcome.bucket_num) {
                    warn!(metric_id = self.metric_id, error = %e, "anomaly tracker rejected bucket");
                }
            }
        }

        self.health
            .buckets_flushed
            .with_label_values(&[&self.label])
            .inc_by(outcome.sealed as f64);
        self.health
            .buckets_skipped
            .with_label_values(&[&self.label])
            .inc_by(outcome.skipped as f64);
    }

    /// Whether a reading at `timestamp_ns` lands in an already closed bucket.
    /// Late readings are counted and dropped.
    pub fn reject_late(&self, timestamp_ns: u64, count: usize) -> bool {
        if !self.engine.is_late(timestamp_ns) {
            return false;
        }
        debug!(
            metric_id = self.metric_id,
            timestamp_ns,
            bucket_start_ns = self.engine.bucket_start_ns(),
            "dropping late reading",
        );
        self.count_dropped(DropReason::Late, count);
        true
    }

    pub fn count_received(&self, count: usize) {
        self.health
            .samples_received
            .with_label_values(&[&self.label])
            .inc_by(count as f64);
    }

    pub fn count_dropped(&self, reason: DropReason, count: usize) {
        self.health
            .samples_dropped
            .with_label_values(&[&self.label, reason.as_str()])
            .inc_by(count as f64);
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs every tracker against the key's current aggregate.
    pub fn detect(&self, timestamp_ns: u64, key: &DimensionKey, current_value: i64) {
        let bucket_num = self.engine.bucket_num();
        for tracker in &self.trackers {
            if tracker.detect_and_declare(timestamp_ns, bucket_num, key, current_value) {
                self.health
                    .anomalies_declared
                    .with_label_values(&[&tracker.alert().id.to_string()])
                    .inc();
            }
        }
    }

    pub fn add_tracker(&mut self, alert: AlertConfig) -> Arc<AnomalyTracker> {
        let tracker = Arc::new(AnomalyTracker::new(alert));
        self.trackers.push(Arc::clone(&tracker));
        tracker
    }

    /// Flushes up to `now_ns`, then drains the history into a JSON report.
    pub fn dump(&mut self, now_ns: u64) -> Result<Vec<u8>> {
        if !self.finished {
            self.flush_if_needed(now_ns);
        }

        let report = MetricReport::new(
            self.metric_id,
            S::KIND,
            self.report_start_ns,
            self.engine.bucket_start_ns(),
            self.engine.drain_past(),
        );
        self.report_start_ns = now_ns;

        debug!(
            metric_id = self.metric_id,
            buckets = report.bucket_count(),
            "report dumped",
        );

        report.to_bytes()
    }

    pub fn byte_size(&self) -> usize {
        let size = self.engine.byte_size();
        self.health
            .producer_bytes
            .with_label_values(&[&self.label])
            .set(size as f64);
        size
    }
}

/// Synchronous pull used on condition changes. Failures yield no readings.
pub(crate) fn pull_now(puller: Option<&Arc<dyn Puller>>, tag: Option<u32>) -> Vec<Sample> {
    let (Some(puller), Some(tag)) = (puller, tag) else {
        return Vec::new();
    };

    match puller.pull(tag) {
        Ok(samples) => samples,
        Err(e) => {
            debug!(tag, error = %e, "condition pull failed");
            Vec::new()
        }
    }
}

/// Host-facing dispatch over the producer kinds.
#[derive(Clone)]
pub enum MetricProducer {
    Value(Arc<ValueProducer>),
    Gauge(Arc<GaugeProducer>),
}

impl std::fmt::Debug for MetricProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricProducer")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

impl MetricProducer {
    /// Builds the producer for `metric`, registering with `puller` when the
    /// metric is pull-based.
    pub fn build(
        metric: &MetricConfig,
        start_ns: u64,
        puller: Option<Arc<dyn Puller>>,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        Ok(match metric.kind {
            MetricKind::Value => Self::Value(ValueProducer::new(metric, start_ns, puller, health)?),
            MetricKind::Gauge => Self::Gauge(GaugeProducer::new(metric, start_ns, puller, health)?),
        })
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Value(p) => p.id(),
            Self::Gauge(p) => p.id(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Value(_) => MetricKind::Value,
            Self::Gauge(_) => MetricKind::Gauge,
        }
    }

    pub fn on_condition_changed(&self, condition: bool, event_time_ns: u64) {
        match self {
            Self::Value(p) => p.on_condition_changed(condition, event_time_ns),
            Self::Gauge(p) => p.on_condition_changed(condition, event_time_ns),
        }
    }

    pub fn on_matched_event(&self, sample: Sample) {
        match self {
            Self::Value(p) => p.on_matched_event(sample),
            Self::Gauge(p) => p.on_matched_event(sample),
        }
    }

    pub fn on_data_pulled(&self, data: Vec<Sample>) {
        match self {
            Self::Value(p) => p.on_data_pulled(data),
            Self::Gauge(p) => p.on_data_pulled(data),
        }
    }

    pub fn add_anomaly_tracker(&self, alert: AlertConfig) -> Arc<AnomalyTracker> {
        match self {
            Self::Value(p) => p.add_anomaly_tracker(alert),
            Self::Gauge(p) => p.add_anomaly_tracker(alert),
        }
    }

    pub fn on_dump_report(&self, now_ns: u64) -> Result<Vec<u8>> {
        match self {
            Self::Value(p) => p.on_dump_report(now_ns),
            Self::Gauge(p) => p.on_dump_report(now_ns),
        }
    }

    pub fn finish(&self, now_ns: u64) {
        match self {
            Self::Value(p) => p.finish(now_ns),
            Self::Gauge(p) => p.finish(now_ns),
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Self::Value(p) => p.byte_size(),
            Self::Gauge(p) => p.byte_size(),
        }
    }
}
