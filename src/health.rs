use anyhow::{Context, Result};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "statbucket";

/// Prometheus metrics describing the aggregation core itself.
///
/// All metrics use the "statbucket" namespace and are labelled by the
/// producing metric id, so one registry can be shared by every producer.
pub struct HealthMetrics {
    registry: Registry,

    /// Samples handed to a producer, by metric id.
    pub samples_received: CounterVec,
    /// Samples dropped by metric id and reason (late/malformed).
    pub samples_dropped: CounterVec,
    /// Buckets sealed into history.
    pub buckets_flushed: CounterVec,
    /// Empty buckets stepped over by a gap-skip.
    pub buckets_skipped: CounterVec,
    /// Counter readings lower than their baseline.
    pub counter_regressions: CounterVec,
    /// Closing readings that found no open baseline.
    pub missing_baseline: CounterVec,
    /// Anomalies declared, by alert id.
    pub anomalies_declared: CounterVec,
    /// Pulls that failed, by tag.
    pub pull_failures: CounterVec,
    /// Pulled batches delivered to receivers, by tag.
    pub pulls_delivered: CounterVec,
    /// Approximate retained memory per producer.
    pub producer_bytes: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let samples_received = CounterVec::new(
            Opts::new(
                "samples_received_total",
                "Total samples handed to a metric producer.",
            )
            .namespace(NAMESPACE),
            &["metric_id"],
        )?;
        let samples_dropped = CounterVec::new(
            Opts::new(
                "samples_dropped_total",
                "Total samples dropped by metric producer and reason.",
            )
            .namespace(NAMESPACE),
            &["metric_id", "reason"],
        )?;
        let buckets_flushed = CounterVec::new(
            Opts::new(
                "buckets_flushed_total",
                "Total per-dimension buckets sealed into history.",
            )
            .namespace(NAMESPACE),
            &["metric_id"],
        )?;
        let buckets_skipped = CounterVec::new(
            Opts::new(
                "buckets_skipped_total",
                "Total empty buckets skipped over without data.",
            )
            .namespace(NAMESPACE),
            &["metric_id"],
        )?;
        let counter_regressions = CounterVec::new(
            Opts::new(
                "counter_regressions_total",
                "Total counter readings lower than their baseline.",
            )
            .namespace(NAMESPACE),
            &["metric_id"],
        )?;
        let missing_baseline = CounterVec::new(
            Opts::new(
                "missing_baseline_total",
                "Total closing readings without an open baseline.",
            )
            .namespace(NAMESPACE),
            &["metric_id"],
        )?;
        let anomalies_declared = CounterVec::new(
            Opts::new("anomalies_declared_total", "Total anomalies declared by alert.")
                .namespace(NAMESPACE),
            &["alert"],
        )?;
        let pull_failures = CounterVec::new(
            Opts::new("pull_failures_total", "Total failed pulls by tag.").namespace(NAMESPACE),
            &["tag"],
        )?;
        let pulls_delivered = CounterVec::new(
            Opts::new(
                "pulls_delivered_total",
                "Total pulled batches delivered to receivers by tag.",
            )
            .namespace(NAMESPACE),
            &["tag"],
        )?;
        let producer_bytes = GaugeVec::new(
            Opts::new(
                "producer_bytes",
                "Approximate memory retained by a metric producer.",
            )
            .namespace(NAMESPACE),
            &["metric_id"],
        )?;

        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(buckets_flushed.clone()))?;
        registry.register(Box::new(buckets_skipped.clone()))?;
        registry.register(Box::new(counter_regressions.clone()))?;
        registry.register(Box::new(missing_baseline.clone()))?;
        registry.register(Box::new(anomalies_declared.clone()))?;
        registry.register(Box::new(pull_failures.clone()))?;
        registry.register(Box::new(pulls_delivered.clone()))?;
        registry.register(Box::new(producer_bytes.clone()))?;

        Ok(Self {
            registry,
            samples_received,
            samples_dropped,
            buckets_flushed,
            buckets_skipped,
            counter_regressions,
            missing_baseline,
            anomalies_declared,
            pull_failures,
            pulls_delivered,
            producer_bytes,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}
