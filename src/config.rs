use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration: the metrics to aggregate and the alerts on them.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Metric producers to build.
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    /// Anomaly alerts attached to metrics.
    #[serde(default)]
    pub alerts: Vec<AlertConfig>,
}

/// Aggregation style of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Sums counter deltas between readings.
    Value,
    /// Records a field snapshot per bucket.
    Gauge,
}

/// Which snapshot a gauge keeps when several arrive within one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    #[default]
    Latest,
    First,
}

/// What a value metric does with a reading lower than its baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionPolicy {
    /// Drop the delta and restart the baseline at the new reading.
    #[default]
    Reset,
    /// Drop the delta and keep the previous, higher baseline.
    Clamp,
}

/// One metric producer.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub id: i64,

    pub kind: MetricKind,

    /// Bucket width. Default: 60s.
    #[serde(default = "default_bucket", with = "humantime_serde")]
    pub bucket: Duration,

    /// Data source tag to pull from. Push-only when absent.
    #[serde(default)]
    pub pull_tag: Option<u32>,

    /// Name of the gating condition. Always true when absent.
    #[serde(default)]
    pub condition: Option<String>,

    /// Gauge: 1-based field positions to record. All fields when absent.
    #[serde(default)]
    pub gauge_fields: Option<Vec<u32>>,

    /// Gauge: snapshot selection within a bucket.
    #[serde(default)]
    pub sampling: SamplingMode,

    /// Value: 1-based position of the counter field.
    #[serde(default)]
    pub value_field: Option<u32>,

    /// Value: handling of decreasing counters.
    #[serde(default)]
    pub counter_regression: RegressionPolicy,
}

/// Threshold alert over the rolling sum of a metric's buckets.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    pub id: i64,

    pub metric_id: i64,

    /// Fires when the windowed sum is strictly greater than this.
    pub trigger_if_sum_gt: i64,

    /// Window length in buckets, current bucket included.
    pub num_buckets: u32,

    /// Quiet time per dimension after a declaration. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub refractory_period: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bucket() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics: Vec::new(),
            alerts: Vec::new(),
        }
    }
}

impl MetricConfig {
    /// A metric with defaults for everything but id and kind.
    pub fn new(id: i64, kind: MetricKind) -> Self {
        Self {
            id,
            kind,
            bucket: default_bucket(),
            pull_tag: None,
            condition: None,
            gauge_fields: None,
            sampling: SamplingMode::default(),
            value_field: None,
            counter_regression: RegressionPolicy::default(),
        }
    }

    pub fn bucket_size_ns(&self) -> u64 {
        u64::try_from(self.bucket.as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Config {
    /// Load configuration from a YAML file at the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.metrics.len());

        for (i, metric) in self.metrics.iter().enumerate() {
            if !ids.insert(metric.id) {
                bail!("metrics[{i}]: duplicate metric id {}", metric.id);
            }

            if metric.bucket.is_zero() {
                bail!("metrics[{i}].bucket must be > 0");
            }

            match metric.kind {
                MetricKind::Value => match metric.value_field {
                    None => bail!("metrics[{i}].value_field is required for value metrics"),
                    Some(0) => bail!("metrics[{i}].value_field positions are 1-based"),
                    Some(_) => {}
                },
                MetricKind::Gauge => {
                    if let Some(fields) = &metric.gauge_fields {
                        if fields.contains(&0) {
                            bail!("metrics[{i}].gauge_fields positions are 1-based");
                        }
                    }
                }
            }
        }

        let mut alert_ids = HashSet::with_capacity(self.alerts.len());

        for (i, alert) in self.alerts.iter().enumerate() {
            if !alert_ids.insert(alert.id) {
                bail!("alerts[{i}]: duplicate alert id {}", alert.id);
            }

            if !ids.contains(&alert.metric_id) {
                bail!(
                    "alerts[{i}].metric_id {} does not match any metric",
                    alert.metric_id,
                );
            }

            if alert.num_buckets == 0 {
                bail!("alerts[{i}].num_buckets must be > 0");
            }
        }

        Ok(())
    }

    /// Alerts attached to the given metric.
    pub fn alerts_for(&self, metric_id: i64) -> impl Iterator<Item = &AlertConfig> {
        self.alerts.iter().filter(move |a| a.metric_id == metric_id)
    }
}
