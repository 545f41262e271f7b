//! Threshold anomaly detection over a rolling window of buckets.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AlertConfig;
use crate::dimension::DimensionKey;

/// Errors raised by misuse of an [`AnomalyTracker`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DetectorError {
    #[error("alert {alert_id}: bucket {bucket_num} for {key} is not after bucket {last}")]
    OutOfOrderBucket {
        alert_id: i64,
        key: DimensionKey,
        bucket_num: u64,
        last: u64,
    },
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Sealed `(bucket_num, value)` pairs still inside the window, per key.
    past: HashMap<DimensionKey, VecDeque<(u64, i64)>>,
    /// Per-key end of the refractory period, in seconds.
    refractory_ends_sec: HashMap<DimensionKey, u64>,
    declared: u64,
}

/// Rolling per-dimension sum over the last `num_buckets` buckets.
///
/// The window is the `num_buckets - 1` sealed buckets preceding the current
/// one plus the current bucket's value.
#[derive(Debug)]
pub struct AnomalyTracker {
    alert: AlertConfig,
    state: Mutex<TrackerState>,
}

impl AnomalyTracker {
    pub fn new(alert: AlertConfig) -> Self {
        Self {
            alert,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn alert(&self) -> &AlertConfig {
        &self.alert
    }

    fn past_window(&self) -> u64 {
        u64::from(self.alert.num_buckets.saturating_sub(1))
    }

    /// Records the value of a sealed bucket. Bucket numbers must strictly
    /// increase per key.
    pub fn add_past_bucket(
        &self,
        key: &DimensionKey,
        value: i64,
        bucket_num: u64,
    ) -> Result<(), DetectorError> {
        let window = self.past_window();
        let mut state = self.state.lock();

        let history = state.past.entry(key.clone()).or_default();
        if let Some(&(last, _)) = history.back() {
            if bucket_num <= last {
                debug_assert!(
                    bucket_num > last,
                    "out of order bucket {bucket_num} after {last} for {key}",
                );
                return Err(DetectorError::OutOfOrderBucket {
                    alert_id: self.alert.id,
                    key: key.clone(),
                    bucket_num,
                    last,
                });
            }
        }

        history.push_back((bucket_num, value));

        // Nothing older than the window of the next bucket matters again. The
        // newest entry stays for the ordering check.
        let oldest = (bucket_num + 1).saturating_sub(window);
        while history.len() > 1 && history.front().is_some_and(|&(num, _)| num < oldest) {
            history.pop_front();
        }

        Ok(())
    }

    /// Sum of the sealed buckets in the window ending before `current_bucket_num`.
    pub fn past_sum(&self, current_bucket_num: u64, key: &DimensionKey) -> i64 {
        let oldest = current_bucket_num.saturating_sub(self.past_window());
        let state = self.state.lock();
        state.past.get(key).map_or(0, |history| {
            history
                .iter()
                .filter(|&&(num, _)| num >= oldest && num < current_bucket_num)
                .fold(0i64, |acc, &(_, v)| acc.saturating_add(v))
        })
    }

    /// Whether the window sum including `current_value` exceeds the threshold.
    pub fn detect(&self, current_bucket_num: u64, key: &DimensionKey, current_value: i64) -> bool {
        let sum = self
            .past_sum(current_bucket_num, key)
            .saturating_add(current_value);
        sum > self.alert.trigger_if_sum_gt
    }

    /// Declares an anomaly for `key` unless it is in its refractory period.
    ///
    /// Returns whether a declaration happened.
    pub fn declare(&self, timestamp_ns: u64, key: &DimensionKey) -> bool {
        let now_sec = timestamp_ns / 1_000_000_000;
        let mut state = self.state.lock();

        if let Some(&ends) = state.refractory_ends_sec.get(key) {
            if now_sec <= ends {
                debug!(
                    alert_id = self.alert.id,
                    dimension = %key,
                    refractory_ends_sec = ends,
                    "anomaly suppressed by refractory period",
                );
                return false;
            }
        }

        let ends = now_sec + self.alert.refractory_period.as_secs();
        state.refractory_ends_sec.insert(key.clone(), ends);
        state.declared += 1;

        warn!(
            alert_id = self.alert.id,
            metric_id = self.alert.metric_id,
            dimension = %key,
            timestamp_ns,
            refractory_ends_sec = ends,
            "anomaly declared",
        );

        true
    }

    /// Runs [`detect`](Self::detect) and, if it fires, [`declare`](Self::declare).
    pub fn detect_and_declare(
        &self,
        timestamp_ns: u64,
        current_bucket_num: u64,
        key: &DimensionKey,
        current_value: i64,
    ) -> bool {
        self.detect(current_bucket_num, key, current_value) && self.declare(timestamp_ns, key)
    }

    /// End of the refractory period for `key` in seconds, 0 if never declared.
    pub fn refractory_period_ends_sec(&self, key: &DimensionKey) -> u64 {
        self.state
            .lock()
            .refractory_ends_sec
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Total anomalies declared by this tracker.
    pub fn declared_count(&self) -> u64 {
        self.state.lock().declared
    }
}
