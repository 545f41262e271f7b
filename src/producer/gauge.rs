//! Snapshot producer: records one field snapshot per key per bucket.

use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{pull_now, ConditionState, ProducerState};
use crate::anomaly::AnomalyTracker;
use crate::bucket::{Sealed, Strategy};
use crate::config::{AlertConfig, MetricConfig, SamplingMode};
use crate::dimension::FieldValue;
use crate::health::HealthMetrics;
use crate::puller::{PullDataReceiver, Puller};
use crate::sample::Sample;

/// One recorded `(field position, value)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeField {
    pub field: u32,
    pub value: FieldValue,
}

/// Seals the recorded snapshot. Snapshots never carry into the next bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotStrategy;

impl Strategy for SnapshotStrategy {
    type Interval = Option<Vec<GaugeField>>;
    type Payload = Vec<GaugeField>;

    const KIND: &'static str = "gauge";

    fn seal(
        &self,
        interval: Option<Vec<GaugeField>>,
        _carry_open: bool,
    ) -> Sealed<Option<Vec<GaugeField>>, Vec<GaugeField>> {
        Sealed {
            payload: interval,
            carry: None,
        }
    }

    fn anomaly_value(&self, payload: &Vec<GaugeField>) -> Option<i64> {
        first_long(payload)
    }

    fn interval_size(&self, interval: &Option<Vec<GaugeField>>) -> usize {
        interval.as_ref().map_or(0, |fields| self.payload_size(fields))
    }

    fn payload_size(&self, payload: &Vec<GaugeField>) -> usize {
        payload
            .iter()
            .map(|f| std::mem::size_of::<u32>() + f.value.byte_size())
            .sum()
    }
}

fn first_long(fields: &[GaugeField]) -> Option<i64> {
    fields.iter().find_map(|f| f.value.as_i64())
}

/// Gauge metric producer.
pub struct GaugeProducer {
    id: i64,
    fields: Option<Vec<u32>>,
    sampling: SamplingMode,
    pull_tag: Option<u32>,
    puller: Option<Arc<dyn Puller>>,
    receiver: Weak<dyn PullDataReceiver>,
    inner: Mutex<ProducerState<SnapshotStrategy>>,
}

impl std::fmt::Debug for GaugeProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeProducer")
            .field("id", &self.id)
            .field("fields", &self.fields)
            .field("sampling", &self.sampling)
            .field("pull_tag", &self.pull_tag)
            .finish()
    }
}

impl GaugeProducer {
    pub fn new(
        metric: &MetricConfig,
        start_ns: u64,
        puller: Option<Arc<dyn Puller>>,
        health: Arc<HealthMetrics>,
    ) -> Result<Arc<Self>> {
        if let (Some(tag), None) = (metric.pull_tag, &puller) {
            bail!("metric {}: pull_tag {tag} requires a puller", metric.id);
        }
        if let Some(fields) = &metric.gauge_fields {
            if fields.contains(&0) {
                bail!("metric {}: gauge field positions are 1-based", metric.id);
            }
        }

        let state = ProducerState::new(metric, SnapshotStrategy, start_ns, health)?;

        let producer = Arc::new_cyclic(|weak: &Weak<Self>| {
            let receiver: Weak<dyn PullDataReceiver> = weak.clone();
            Self {
                id: metric.id,
                fields: metric.gauge_fields.clone(),
                sampling: metric.sampling,
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
            kind = SnapshotStrategy::KIND,
            pull_tag = ?metric.pull_tag,
            condition = ?metric.condition,
            sampling = ?metric.sampling,
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

        if !state.engine.is_late(event_time_ns) {
            state.flush_if_needed(event_time_ns);
        }
        state.condition = next;

        if condition {
            let samples = pull_now(self.puller.as_ref(), self.pull_tag);
            self.record_all(&mut state, samples);
        }
    }

    pub fn on_matched_event(&self, sample: Sample) {
        let mut state = self.inner.lock();
        if state.finished {
            return;
        }
        self.record_all(&mut state, vec![sample]);
    }

    pub fn add_anomaly_tracker(&self, alert: AlertConfig) -> Arc<AnomalyTracker> {
        self.inner.lock().add_tracker(alert)
    }

    pub fn on_dump_report(&self, now_ns: u64) -> Result<Vec<u8>> {
        self.inner.lock().dump(now_ns)
    }

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

    fn record_all(&self, state: &mut ProducerState<SnapshotStrategy>, samples: Vec<Sample>) {
        state.count_received(samples.len());
        for sample in samples {
            self.record(state, sample);
        }
    }

    fn record(&self, state: &mut ProducerState<SnapshotStrategy>, sample: Sample) {
        let timestamp_ns = sample.timestamp_ns;
        if state.reject_late(timestamp_ns, 1) {
            return;
        }

        state.flush_if_needed(timestamp_ns);
        if !state.condition.is_active() {
            return;
        }

        let snapshot = self.snapshot(&sample);
        let key = sample.key;
        let slot = state.engine.interval_mut(&key);
        if self.sampling == SamplingMode::First && slot.is_some() {
            return;
        }

        let value = first_long(&snapshot);
        *slot = Some(snapshot);

        if let Some(value) = value {
            state.detect(timestamp_ns, &key, value);
        }
    }

    /// Selects the configured fields, or every field. A sample missing any
    /// configured field yields an empty snapshot.
    fn snapshot(&self, sample: &Sample) -> Vec<GaugeField> {
        let Some(positions) = &self.fields else {
            return (1u32..)
                .zip(&sample.fields)
                .map(|(field, value)| GaugeField {
                    field,
                    value: value.clone(),
                })
                .collect();
        };

        let selected: Option<Vec<GaugeField>> = positions
            .iter()
            .map(|&field| {
                sample.field(field as usize).map(|value| GaugeField {
                    field,
                    value: value.clone(),
                })
            })
            .collect();

        selected.unwrap_or_else(|| {
            debug!(
                metric_id = self.id,
                dimension = %sample.key,
                "sample lacks gauge fields, recording empty snapshot",
            );
            Vec::new()
        })
    }
}

impl PullDataReceiver for GaugeProducer {
    fn on_data_pulled(&self, data: Vec<Sample>) {
        let mut state = self.inner.lock();
        if state.finished {
            debug!(metric_id = self.id, "pull after finish ignored");
            return;
        }
        self.record_all(&mut state, data);
    }
}
