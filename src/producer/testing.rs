use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::dimension::{DimensionKey, FieldValue};
use crate::health::HealthMetrics;
use crate::puller::{PullDataReceiver, PullError, Puller};
use crate::report::MetricReport;
use crate::sample::Sample;

pub const NS: u64 = 1_000_000_000;
pub const BUCKET_NS: u64 = 60 * NS;
pub const START_NS: u64 = 10 * NS;

/// Puller returning queued responses and recording registrations.
#[derive(Default)]
pub struct MockPuller {
    responses: Mutex<VecDeque<Result<Vec<Sample>, PullError>>>,
    pub registered: Mutex<Vec<(u32, Weak<dyn PullDataReceiver>, u64, u64)>>,
    pub unregistered: Mutex<Vec<u32>>,
    pub pulls: Mutex<Vec<u32>>,
}

impl MockPuller {
    pub fn push_response(&self, response: Result<Vec<Sample>, PullError>) {
        self.responses.lock().push_back(response);
    }

    /// Delivers `data` to every registered receiver still alive.
    pub fn deliver(&self, data: Vec<Sample>) {
        let receivers: Vec<_> = self
            .registered
            .lock()
            .iter()
            .filter_map(|(_, r, _, _)| r.upgrade())
            .collect();
        for receiver in receivers {
            receiver.on_data_pulled(data.clone());
        }
    }
}

impl Puller for MockPuller {
    fn register_receiver(
        &self,
        tag: u32,
        receiver: Weak<dyn PullDataReceiver>,
        first_pull_ns: u64,
        interval_ns: u64,
    ) {
        self.registered
            .lock()
            .push((tag, receiver, first_pull_ns, interval_ns));
    }

    fn unregister_receiver(&self, tag: u32, _receiver: &Weak<dyn PullDataReceiver>) {
        self.unregistered.lock().push(tag);
    }

    fn pull(&self, tag: u32) -> Result<Vec<Sample>, PullError> {
        self.pulls.lock().push(tag);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

pub fn health() -> Arc<HealthMetrics> {
    Arc::new(HealthMetrics::new().expect("metrics"))
}

pub fn key(name: &str) -> DimensionKey {
    DimensionKey::new([(1, name)])
}

/// A sample for `key` whose field 1 is the key name and field 2 is `value`.
pub fn reading(name: &str, timestamp_ns: u64, value: i64) -> Sample {
    Sample::new(
        key(name),
        timestamp_ns,
        vec![FieldValue::from(name), FieldValue::Int(value)],
    )
}

pub fn parse_report<P: serde::de::DeserializeOwned>(bytes: &[u8]) -> MetricReport<P> {
    serde_json::from_slice(bytes).expect("valid report")
}
