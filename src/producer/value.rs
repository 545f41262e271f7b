//! Accumulating producer: sums counter deltas while the condition is true.

use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{pull_now, ConditionState, DropReason, ProducerState};
use crate::anomaly::AnomalyTracker;
use crate::bucket::{Sealed, Strategy};
use crate::config::{AlertConfig, MetricConfig, RegressionPolicy};
use crate::health::HealthMetrics;
use crate::puller::{PullDataReceiver, Puller};
use crate::sample::Sample;

/// How a reading relates to the true interval it was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reading {
    /// Taken as the condition turns true.
    Opening,
    /// Taken while the condition stays true.
    Intermediate,
    /// Taken as the condition turns false.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadingOutcome {
    Baseline,
    Delta,
    Regression,
    MissingBaseline,
}

/// Open baseline and running delta sum of one key in the active bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueInterval {
    pub base: Option<i64>,
    pub sum: i64,
    pub has_delta: bool,
}

impl ValueInterval {
    fn apply(&mut self, value: i64, reading: Reading, policy: RegressionPolicy) -> ReadingOutcome {
        let base = match (reading, self.base) {
            (Reading::Opening, _) | (Reading::Intermediate, None) => {
                self.base = Some(value);
                return ReadingOutcome::Baseline;
            }
            (Reading::Closing, None) => return ReadingOutcome::MissingBaseline,
            (_, Some(base)) => base,
        };

        let outcome = if value >= base {
            self.sum = self.sum.saturating_add(value.saturating_sub(base));
            self.has_delta = true;
            self.base = Some(value);
            ReadingOutcome::Delta
        } else {
            if policy == RegressionPolicy::Reset {
                self.base = Some(value);
            }
            ReadingOutcome::Regression
        };

        if reading == Reading::Closing {
            self.base = None;
        }

        outcome
    }
}

/// Seals the delta sum; carries the open baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaStrategy;

impl Strategy for DeltaStrategy {
    type Interval = ValueInterval;
    type Payload = i64;

    const KIND: &'static str = "value";

    fn seal(&self, interval: ValueInterval, carry_open: bool) -> Sealed<ValueInterval, i64> {
        let carry = match interval.base {
            Some(base) if carry_open => Some(ValueInterval {
                base: Some(base),
                ..ValueInterval::default()
            }),
            _ => None,
        };

        Sealed {
            payload: interval.has_delta.then_some(interval.sum),
            carry,
        }
    }

    fn anomaly_value(&self, payload: &i64) -> Option<i64> {
        Some(*payload)
    }

    fn interval_size(&self, _interval: &ValueInterval) -> usize {
        std::mem::size_of::<ValueInterval>()
    }

    fn payload_size(&self, _payload: &i64) -> usize {
        std::mem::size_of::<i64>()
    }
}

/// Value metric producer.
pub struct ValueProducer {
    id: i64,
    value_field: usize,
    policy: RegressionPolicy,
    pull_tag: Option<u32>,
    puller: Option<Arc<dyn Puller>>,
    receiver: Weak<dyn PullDataReceiver>,
    inner: Mutex<ProducerState<DeltaStrategy>>,
}

impl std::fmt::Debug for ValueProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueProducer")
            .field("id", &self.id)
            .field("value_field", &self.value_field)
            .field("pull_tag", &self.pull_tag)
            .finish()
    }
}

impl ValueProducer {
    /// Creates the producer and registers it for scheduled pulls at every
    /// bucket boundary when `pull_tag` is set.
    pub fn new(
        metric: &MetricConfig,
        start_ns: u64,
        puller: Option<Arc<dyn Puller>>,
        health: Arc<HealthMetrics>,
    ) -> Result<Arc<Self>> {
        let value_field = match metric.value_field {
            Some(field) if field > 0 => field as usize,
            _ => bail!("metric {}: value_field is required", metric.id),
        };
        if let (Some(tag), None) = (metric.pull_tag, &puller) {
            bail!("metric {}: pull_tag {tag} requires a puller", metric.id);
        }

        let state = ProducerState::new(metric, DeltaStrategy, start_ns, health)?;

        let producer = Arc::new_cyclic(|weak: &Weak<Self>| {
            let receiver: Weak<dyn PullDataReceiver> = weak.clone();
            Self {
                id: metric.id,
                value_field,
                policy: metric.counter_regression,
                pull_tag: metric.pull_tag,
                puller,
                receiver,
                inner: Mutex::new(state),
            }
        });

        if let (Some(puller), Some(tag)) = (&producer.puller, producer.pull_tag) {
            let size = metric.bucket_size_ns();
            puller.register_receiver(
                tag,
                producer.receiver.clone(),
                start_ns.saturating_add(size),
                size,
            );
        }

        info!(
            metric_id = metric.id,
            kind = DeltaStrategy::KIND,
            pull_tag = ?metric.pull_tag,
            condition = ?metric.condition,
            "producer created",
        );

        Ok(producer)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn on_condition_changed(&self, condition: bool, event_time_ns: u64) {
        let mut state = self.inner.lock();
        if state.finished {
            debug!(metric_id = self.id, "condition change after finish ignored");
            return;
        }
        if state.condition == ConditionState::Unconditioned {
            debug!(metric_id = self.id, "metric has no condition, change ignored");
            return;
        }

        let next = if condition {
            ConditionState::True
        } else {
            ConditionState::False
        };
        if state.condition == next {
            return;
        }

        debug!(metric_id = self.id, condition, event_time_ns, "condition changed");

        let reading = if condition {
            Reading::Opening
        } else {
            Reading::Closing
        };
        let samples = pull_now(self.puller.as_ref(), self.pull_tag);
        self.apply_batch(&mut state, samples, event_time_ns, reading, Some(next));
    }

    pub fn on_matched_event(&self, sample: Sample) {
        let mut state = self.inner.lock();
        if state.finished || !state.condition.is_active() {
            return;
        }

        let timestamp_ns = sample.timestamp_ns;
        self.apply_batch(&mut state, vec![sample], timestamp_ns, Reading::Intermediate, None);
    }

    pub fn add_anomaly_tracker(&self, alert: AlertConfig) -> Arc<AnomalyTracker> {
        self.inner.lock().add_tracker(alert)
    }

    pub fn on_dump_report(&self, now_ns: u64) -> Result<Vec<u8>> {
        self.inner.lock().dump(now_ns)
    }

    /// Flushes up to `now_ns`, force-flushes the open bucket and stops
    /// accepting callbacks.
    pub fn finish(&self, now_ns: u64) {
        let mut state = self.inner.lock();
        if state.finished {
            return;
        }

        state.flush_if_needed(now_ns);
        state.force_flush();
        state.finished = true;

        if let (Some(puller), Some(tag)) = (&self.puller, self.pull_tag) {
            puller.unregister_receiver(tag, &self.receiver);
        }

        info!(metric_id = self.id, now_ns, "producer finished");
    }

    pub fn byte_size(&self) -> usize {
        self.inner.lock().byte_size()
    }

    /// Applies one batch of readings taken at `batch_ns`.
    ///
    /// Opening readings and readings past the drift tolerance of the active
    /// bucket flush first. Any other reading closes the active bucket, then
    /// flushes, so a pull just after a boundary is attributed to the bucket it
    /// terminates and seeds the next one through carry-over.
    fn apply_batch(
        &self,
        state: &mut ProducerState<DeltaStrategy>,
        samples: Vec<Sample>,
        batch_ns: u64,
        reading: Reading,
        next_condition: Option<ConditionState>,
    ) {
        state.count_received(samples.len());

        if state.reject_late(batch_ns, samples.len()) {
            if let Some(condition) = next_condition {
                state.condition = condition;
            }
            return;
        }

        let engine = &state.engine;
        let drift_limit = engine
            .bucket_end_ns()
            .saturating_add(engine.bucket_size_ns() / 2);
        if reading == Reading::Opening || batch_ns >= drift_limit {
            state.flush_if_needed(batch_ns);
        }

        if let Some(condition) = next_condition {
            state.condition = condition;
        }

        for sample in samples {
            self.apply_reading(state, sample, batch_ns, reading);
        }

        state.flush_if_needed(batch_ns);
    }

    fn apply_reading(
        &self,
        state: &mut ProducerState<DeltaStrategy>,
        sample: Sample,
        timestamp_ns: u64,
        reading: Reading,
    ) {
        let Some(value) = sample.long(self.value_field) else {
            debug!(
                metric_id = self.id,
                dimension = %sample.key,
                field = self.value_field,
                "reading has no integer value field",
            );
            state.count_dropped(DropReason::Malformed, 1);
            return;
        };

        let key = sample.key;
        let interval = state.engine.interval_mut(&key);
        let outcome = interval.apply(value, reading, self.policy);
        let sum = interval.sum;

        match outcome {
            ReadingOutcome::Baseline => {}
            ReadingOutcome::Delta => state.detect(timestamp_ns, &key, sum),
            ReadingOutcome::Regression => {
                debug!(
                    metric_id = self.id,
                    dimension = %key,
                    value,
                    policy = ?self.policy,
                    "counter regression",
                );
                state
                    .health()
                    .counter_regressions
                    .with_label_values(&[state.label()])
                    .inc();
            }
            ReadingOutcome::MissingBaseline => {
                debug!(
                    metric_id = self.id,
                    dimension = %key,
                    value,
                    "closing reading without baseline",
                );
                state
                    .health()
                    .missing_baseline
                    .with_label_values(&[state.label()])
                    .inc();
            }
        }
    }
}

impl PullDataReceiver for ValueProducer {
    fn on_data_pulled(&self, data: Vec<Sample>) {
        let Some(batch_ns) = data.iter().map(|s| s.timestamp_ns).max() else {
            return;
        };

        let mut state = self.inner.lock();
        if state.finished {
            debug!(metric_id = self.id, "pull after finish ignored");
            return;
        }

        if !state.condition.is_active() {
            if !state.engine.is_late(batch_ns) {
                state.flush_if_needed(batch_ns);
            }
            return;
        }

        self.apply_batch(&mut state, data, batch_ns, Reading::Intermediate, None);
    }
}
