//! Fixed-width bucketing shared by every metric producer.
//!
//! A [`BucketEngine`] owns the in-progress per-dimension state of the active
//! bucket and the history of completed buckets. What an in-progress interval
//! holds, and what it seals into, is decided by a [`Strategy`].

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dimension::DimensionKey;

/// A completed bucket for one dimension key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket<P> {
    pub start_ns: u64,
    pub end_ns: u64,
    /// Index of the bucket relative to the producer start time.
    pub bucket_num: u64,
    pub payload: P,
}

/// Result of sealing one in-progress interval at a bucket boundary.
#[derive(Debug)]
pub struct Sealed<I, P> {
    /// Payload to append to the key's history, if the interval produced one.
    pub payload: Option<P>,
    /// State that stays open and seeds the same key in the next bucket.
    pub carry: Option<I>,
}

/// Aggregation policy plugged into a [`BucketEngine`].
pub trait Strategy {
    /// In-progress state for one key within the active bucket.
    type Interval: Default + fmt::Debug;
    /// Sealed per-bucket aggregate.
    type Payload: Clone + fmt::Debug + Serialize;

    /// Short name used in reports.
    const KIND: &'static str;

    /// Seals `interval` at a boundary. `carry_open` is true when the gating
    /// condition is still true.
    fn seal(&self, interval: Self::Interval, carry_open: bool)
        -> Sealed<Self::Interval, Self::Payload>;

    /// Value fed to anomaly trackers for a sealed payload.
    fn anomaly_value(&self, payload: &Self::Payload) -> Option<i64>;

    fn interval_size(&self, interval: &Self::Interval) -> usize;

    fn payload_size(&self, payload: &Self::Payload) -> usize;
}

/// Summary of one flush, used to feed anomaly trackers and counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushOutcome {
    /// Index of the bucket that was sealed.
    pub bucket_num: u64,
    pub bucket_end_ns: u64,
    /// Keys that appended a bucket to history.
    pub sealed: usize,
    /// Keys carried into the next bucket.
    pub carried: usize,
    /// Empty buckets stepped over beyond the sealed one.
    pub skipped: u64,
    /// `(key, value)` pairs for anomaly trackers, in key order.
    pub anomaly_values: Vec<(DimensionKey, i64)>,
}

/// Current and past bucket state for one producer.
pub struct BucketEngine<S: Strategy> {
    strategy: S,
    bucket_size_ns: u64,
    bucket_start_ns: u64,
    bucket_num: u64,
    current: HashMap<DimensionKey, S::Interval>,
    past: HashMap<DimensionKey, Vec<Bucket<S::Payload>>>,
    past_bytes: usize,
}

impl<S: Strategy> fmt::Debug for BucketEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketEngine")
            .field("kind", &S::KIND)
            .field("bucket_size_ns", &self.bucket_size_ns)
            .field("bucket_start_ns", &self.bucket_start_ns)
            .field("bucket_num", &self.bucket_num)
            .field("current", &self.current.len())
            .field("past", &self.past.len())
            .finish()
    }
}

impl<S: Strategy> BucketEngine<S> {
    /// Creates an engine whose bucket 0 starts at `start_ns`.
    pub fn new(strategy: S, start_ns: u64, bucket_size_ns: u64) -> Result<Self> {
        if bucket_size_ns == 0 {
            bail!("bucket size must be > 0");
        }

        Ok(Self {
            strategy,
            bucket_size_ns,
            bucket_start_ns: start_ns,
            bucket_num: 0,
            current: HashMap::new(),
            past: HashMap::new(),
            past_bytes: 0,
        })
    }

    pub fn bucket_size_ns(&self) -> u64 {
        self.bucket_size_ns
    }

    /// Start of the active bucket.
    pub fn bucket_start_ns(&self) -> u64 {
        self.bucket_start_ns
    }

    /// Exclusive end of the active bucket.
    pub fn bucket_end_ns(&self) -> u64 {
        self.bucket_start_ns.saturating_add(self.bucket_size_ns)
    }

    /// Index of the active bucket.
    pub fn bucket_num(&self) -> u64 {
        self.bucket_num
    }

    /// Whether `timestamp_ns` falls before the active bucket, i.e. into a
    /// bucket that may already be sealed.
    pub fn is_late(&self, timestamp_ns: u64) -> bool {
        timestamp_ns < self.bucket_start_ns
    }

    pub fn current(&self) -> &HashMap<DimensionKey, S::Interval> {
        &self.current
    }

    /// Returns the in-progress interval for `key`, creating an empty one.
    pub fn interval_mut(&mut self, key: &DimensionKey) -> &mut S::Interval {
        self.current.entry(key.clone()).or_default()
    }

    pub fn past(&self) -> &HashMap<DimensionKey, Vec<Bucket<S::Payload>>> {
        &self.past
    }

    /// Seals the active bucket if `now_ns` has reached its end, then moves
    /// the active bucket to the one containing `now_ns`.
    ///
    /// Buckets stepped over without data are not synthesized.
    pub fn flush_if_needed(&mut self, now_ns: u64, carry_open: bool) -> Option<FlushOutcome> {
        if now_ns < self.bucket_end_ns() {
            return None;
        }

        let mut outcome = self.seal_current(carry_open);

        let forward = (now_ns - self.bucket_start_ns) / self.bucket_size_ns;
        outcome.skipped = forward - 1;
        if forward > 1 {
            debug!(
                kind = S::KIND,
                skipped = forward - 1,
                "skipping forward over empty buckets",
            );
        }
        self.advance(forward);

        Some(outcome)
    }

    /// Seals the active bucket regardless of the clock and opens the next one.
    pub fn force_flush(&mut self, carry_open: bool) -> FlushOutcome {
        let outcome = self.seal_current(carry_open);
        self.advance(1);
        outcome
    }

    fn seal_current(&mut self, carry_open: bool) -> FlushOutcome {
        let start_ns = self.bucket_start_ns;
        let end_ns = self.bucket_end_ns();
        let bucket_num = self.bucket_num;

        let mut outcome = FlushOutcome {
            bucket_num,
            bucket_end_ns: end_ns,
            ..FlushOutcome::default()
        };

        let mut next = HashMap::with_capacity(self.current.len());
        for (key, interval) in self.current.drain() {
            let sealed = self.strategy.seal(interval, carry_open);

            if let Some(payload) = sealed.payload {
                if let Some(value) = self.strategy.anomaly_value(&payload) {
                    outcome.anomaly_values.push((key.clone(), value));
                }
                self.past_bytes += key.byte_size() + self.strategy.payload_size(&payload);

                let history = self.past.entry(key.clone()).or_default();
                debug_assert!(
                    history.last().map_or(true, |b| b.bucket_num < bucket_num),
                    "past buckets must be strictly increasing",
                );
                history.push(Bucket {
                    start_ns,
                    end_ns,
                    bucket_num,
                    payload,
                });
                outcome.sealed += 1;
            }

            if let Some(carry) = sealed.carry {
                next.insert(key, carry);
                outcome.carried += 1;
            }
        }
        self.current = next;

        outcome.anomaly_values.sort_by(|a, b| a.0.cmp(&b.0));

        debug!(
            kind = S::KIND,
            bucket_num,
            sealed = outcome.sealed,
            carried = outcome.carried,
            "bucket sealed",
        );

        outcome
    }

    fn advance(&mut self, forward: u64) {
        self.bucket_start_ns += forward * self.bucket_size_ns;
        self.bucket_num += forward;
    }

    /// Removes and returns the full history, ordered by key.
    pub fn drain_past(&mut self) -> Vec<(DimensionKey, Vec<Bucket<S::Payload>>)> {
        let mut drained: Vec<_> = self.past.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        self.past_bytes = 0;
        drained
    }

    /// Approximate retained memory of current and past state.
    pub fn byte_size(&self) -> usize {
        let current: usize = self
            .current
            .iter()
            .map(|(k, v)| k.byte_size() + self.strategy.interval_size(v))
            .sum();
        let bucket_overhead =
            self.past.values().map(Vec::len).sum::<usize>() * std::mem::size_of::<[u64; 3]>();
        current + self.past_bytes + bucket_overhead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: u64 = 60_000_000_000;
    const START: u64 = 10_000_000_000;

    /// Sums values; keeps the running total open when carrying.
    #[derive(Debug)]
    struct SumStrategy;

    #[derive(Debug, Default)]
    struct SumInterval {
        sum: i64,
        touched: bool,
    }

    impl Strategy for SumStrategy {
        type Interval = SumInterval;
        type Payload = i64;
        const KIND: &'static str = "sum";

        fn seal(&self, interval: SumInterval, carry_open: bool) -> Sealed<SumInterval, i64> {
            Sealed {
                payload: interval.touched.then_some(interval.sum),
                carry: carry_open.then(SumInterval::default),
            }
        }

        fn anomaly_value(&self, payload: &i64) -> Option<i64> {
            Some(*payload)
        }

        fn interval_size(&self, _interval: &SumInterval) -> usize {
            std::mem::size_of::<SumInterval>()
        }

        fn payload_size(&self, _payload: &i64) -> usize {
            std::mem::size_of::<i64>()
        }
    }

    fn engine() -> BucketEngine<SumStrategy> {
        BucketEngine::new(SumStrategy, START, BUCKET).expect("valid engine")
    }

    fn add(engine: &mut BucketEngine<SumStrategy>, key: &DimensionKey, v: i64) {
        let interval = engine.interval_mut(key);
        interval.sum += v;
        interval.touched = true;
    }

    #[test]
    fn test_new_rejects_zero_bucket_size() {
        let err = BucketEngine::new(SumStrategy, START, 0).expect_err("should fail");
        assert!(err.to_string().contains("bucket size"));
    }

    #[test]
    fn test_no_flush_before_bucket_end() {
        let mut e = engine();
        let key = DimensionKey::default();
        add(&mut e, &key, 5);

        assert!(e.flush_if_needed(START + BUCKET - 1, false).is_none());
        assert_eq!(e.current().len(), 1);
        assert!(e.past().is_empty());
    }

    #[test]
    fn test_flush_seals_and_advances() {
        let mut e = engine();
        let key = DimensionKey::new([(1, 7i64)]);
        add(&mut e, &key, 5);
        add(&mut e, &key, 3);

        let outcome = e.flush_if_needed(START + BUCKET, false).expect("flushed");
        assert_eq!(outcome.bucket_num, 0);
        assert_eq!(outcome.sealed, 1);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.anomaly_values, vec![(key.clone(), 8)]);

        let history = e.past().get(&key).expect("history");
        assert_eq!(
            history,
            &vec![Bucket {
                start_ns: START,
                end_ns: START + BUCKET,
                bucket_num: 0,
                payload: 8,
            }]
        );
        assert_eq!(e.bucket_start_ns(), START + BUCKET);
        assert_eq!(e.bucket_num(), 1);
        assert!(e.current().is_empty());
    }

    #[test]
    fn test_gap_skips_forward_without_synthesizing_buckets() {
        let mut e = engine();
        let key = DimensionKey::default();
        add(&mut e, &key, 1);

        let outcome = e
            .flush_if_needed(START + 4 * BUCKET + 10, false)
            .expect("flushed");
        assert_eq!(outcome.skipped, 3);
        assert_eq!(e.bucket_num(), 4);
        assert_eq!(e.bucket_start_ns(), START + 4 * BUCKET);
        assert_eq!(e.past().get(&key).map(Vec::len), Some(1));

        add(&mut e, &key, 2);
        e.flush_if_needed(START + 5 * BUCKET, false);
        let nums: Vec<u64> = e.past()[&key].iter().map(|b| b.bucket_num).collect();
        assert_eq!(nums, vec![0, 4]);
        let last = e.past()[&key].last().expect("bucket");
        assert_eq!(last.start_ns, START + 4 * BUCKET);
        assert_eq!(last.end_ns - last.start_ns, BUCKET);
    }

    #[test]
    fn test_empty_flush_only_advances() {
        let mut e = engine();
        let outcome = e.flush_if_needed(START + 2 * BUCKET, false).expect("flushed");
        assert_eq!(outcome.sealed, 0);
        assert!(e.past().is_empty());
        assert_eq!(e.bucket_num(), 2);
    }

    #[test]
    fn test_carry_seeds_next_bucket() {
        let mut e = engine();
        let key = DimensionKey::default();
        add(&mut e, &key, 4);

        let outcome = e.flush_if_needed(START + BUCKET, true).expect("flushed");
        assert_eq!(outcome.carried, 1);
        assert!(e.current().contains_key(&key));
    }

    #[test]
    fn test_force_flush_seals_open_bucket() {
        let mut e = engine();
        let key = DimensionKey::default();
        add(&mut e, &key, 9);

        let outcome = e.force_flush(false);
        assert_eq!(outcome.sealed, 1);
        assert_eq!(e.past()[&key][0].payload, 9);
        assert_eq!(e.past()[&key][0].end_ns, START + BUCKET);
        assert_eq!(e.bucket_num(), 1);
    }

    #[test]
    fn test_drain_past_clears_history_only() {
        let mut e = engine();
        let a = DimensionKey::new([(1, 2i64)]);
        let b = DimensionKey::new([(1, 1i64)]);
        add(&mut e, &a, 1);
        add(&mut e, &b, 1);
        e.flush_if_needed(START + BUCKET, false);
        add(&mut e, &a, 3);
        assert!(e.byte_size() > 0);

        let drained = e.drain_past();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, b);
        assert!(e.past().is_empty());
        assert_eq!(e.current().len(), 1);
    }

    #[test]
    fn test_late_events_detected() {
        let mut e = engine();
        e.flush_if_needed(START + BUCKET, false);
        assert!(e.is_late(START + BUCKET - 1));
        assert!(!e.is_late(START + BUCKET));
    }
}
