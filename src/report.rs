use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bucket::Bucket;
use crate::dimension::DimensionKey;

/// Completed buckets of one metric since the previous report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport<P> {
    pub metric_id: i64,
    pub kind: String,
    pub start_report_ns: u64,
    pub end_report_ns: u64,
    pub dimensions: Vec<DimensionReport<P>>,
}

/// Ordered buckets of one dimension key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionReport<P> {
    pub key: DimensionKey,
    pub buckets: Vec<Bucket<P>>,
}

impl<P: Serialize> MetricReport<P> {
    pub fn new(
        metric_id: i64,
        kind: &str,
        start_report_ns: u64,
        end_report_ns: u64,
        drained: Vec<(DimensionKey, Vec<Bucket<P>>)>,
    ) -> Self {
        Self {
            metric_id,
            kind: kind.to_string(),
            start_report_ns,
            end_report_ns,
            dimensions: drained
                .into_iter()
                .map(|(key, buckets)| DimensionReport { key, buckets })
                .collect(),
        }
    }

    /// Number of buckets across all dimensions.
    pub fn bucket_count(&self) -> usize {
        self.dimensions.iter().map(|d| d.buckets.len()).sum()
    }

    /// Serializes the report as a single JSON document.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .with_context(|| format!("serializing report for metric {}", self.metric_id))
    }
}
