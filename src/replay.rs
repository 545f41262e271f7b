//! Scripted replay: drives producers from a recorded trace of conditions,
//! alarms, pushed events and dump requests.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::health::HealthMetrics;
use crate::producer::MetricProducer;
use crate::puller::{PullError, PullSource, Puller, PullerManager};
use crate::sample::Sample;

/// A recorded session.
#[derive(Debug, Deserialize)]
pub struct Trace {
    /// Start of bucket 0 for every producer.
    pub start_ns: u64,

    /// Finish time. Defaults to the last event time.
    #[serde(default)]
    pub end_ns: Option<u64>,

    /// Canned pull responses per tag, returned in order.
    #[serde(default)]
    pub pulls: HashMap<u32, Vec<Vec<Sample>>>,

    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

/// One timeline entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    Condition {
        at_ns: u64,
        condition: String,
        value: bool,
    },
    Alarm {
        at_ns: u64,
    },
    Push {
        metric_id: i64,
        sample: Sample,
    },
    Dump {
        at_ns: u64,
    },
}

impl TraceEvent {
    pub fn at_ns(&self) -> u64 {
        match self {
            Self::Condition { at_ns, .. } | Self::Alarm { at_ns } | Self::Dump { at_ns } => *at_ns,
            Self::Push { sample, .. } => sample.timestamp_ns,
        }
    }
}

impl Trace {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading trace file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing trace file {}", path.display()))
    }

    fn end_ns(&self) -> u64 {
        self.end_ns.unwrap_or_else(|| {
            self.events
                .iter()
                .map(TraceEvent::at_ns)
                .max()
                .unwrap_or(self.start_ns)
        })
    }
}

/// Pull source answering from queued batches.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    batches: Mutex<HashMap<u32, VecDeque<Vec<Sample>>>>,
}

impl ScriptedSource {
    pub fn new(pulls: HashMap<u32, Vec<Vec<Sample>>>) -> Self {
        Self {
            batches: Mutex::new(
                pulls
                    .into_iter()
                    .map(|(tag, batches)| (tag, batches.into()))
                    .collect(),
            ),
        }
    }

    pub fn tags(&self) -> Vec<u32> {
        self.batches.lock().keys().copied().collect()
    }
}

impl PullSource for ScriptedSource {
    fn pull(&self, tag: u32) -> Result<Vec<Sample>, PullError> {
        self.batches
            .lock()
            .get_mut(&tag)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| PullError::SourceFailed {
                tag,
                reason: "script exhausted".to_string(),
            })
    }
}

/// Counts of what a replay did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub deliveries: usize,
    pub reports: usize,
}

/// Runs `trace` against the producers in `config`, writing each report as
/// one JSON line to `out`.
pub fn run<W: Write>(
    config: &Config,
    trace: Trace,
    health: Arc<HealthMetrics>,
    out: &mut W,
) -> Result<ReplaySummary> {
    let end_ns = trace.end_ns();
    let source = Arc::new(ScriptedSource::new(trace.pulls));
    let manager = Arc::new(PullerManager::new().with_health(Arc::clone(&health)));
    for tag in source.tags() {
        manager.add_source(tag, source.clone() as Arc<dyn PullSource>);
    }

    let mut producers = Vec::with_capacity(config.metrics.len());
    for metric in &config.metrics {
        let producer = MetricProducer::build(
            metric,
            trace.start_ns,
            Some(manager.clone() as Arc<dyn Puller>),
            Arc::clone(&health),
        )
        .with_context(|| format!("building producer for metric {}", metric.id))?;

        for alert in config.alerts_for(metric.id) {
            producer.add_anomaly_tracker(alert.clone());
        }
        producers.push(producer);
    }

    let mut by_condition: HashMap<&str, Vec<&MetricProducer>> = HashMap::new();
    let mut by_id: HashMap<i64, &MetricProducer> = HashMap::new();
    for (metric, producer) in config.metrics.iter().zip(&producers) {
        if let Some(condition) = &metric.condition {
            by_condition.entry(condition).or_default().push(producer);
        }
        by_id.insert(metric.id, producer);
    }

    info!(
        producers = producers.len(),
        events = trace.events.len(),
        start_ns = trace.start_ns,
        end_ns,
        "replay started",
    );

    let mut summary = ReplaySummary::default();

    for event in trace.events {
        summary.events += 1;
        match event {
            TraceEvent::Condition {
                at_ns,
                condition,
                value,
            } => {
                let targets = by_condition.get(condition.as_str());
                debug!(
                    condition = %condition,
                    value,
                    at_ns,
                    producers = targets.map_or(0, Vec::len),
                    "condition event",
                );
                for producer in targets.into_iter().flatten() {
                    producer.on_condition_changed(value, at_ns);
                }
            }
            TraceEvent::Alarm { at_ns } => {
                summary.deliveries += manager.on_alarm_fired(at_ns);
            }
            TraceEvent::Push { metric_id, sample } => {
                let Some(producer) = by_id.get(&metric_id) else {
                    bail!("push event references unknown metric {metric_id}");
                };
                producer.on_matched_event(sample);
            }
            TraceEvent::Dump { at_ns } => {
                for producer in &producers {
                    write_report(out, producer, at_ns)?;
                    summary.reports += 1;
                }
            }
        }
    }

    for producer in &producers {
        producer.finish(end_ns);
        write_report(out, producer, end_ns)?;
        summary.reports += 1;

        health
            .producer_bytes
            .with_label_values(&[&producer.id().to_string()])
            .set(producer.byte_size() as f64);
    }

    info!(
        events = summary.events,
        deliveries = summary.deliveries,
        reports = summary.reports,
        "replay finished",
    );

    Ok(summary)
}

fn write_report<W: Write>(out: &mut W, producer: &MetricProducer, at_ns: u64) -> Result<()> {
    let report = producer.on_dump_report(at_ns)?;
    out.write_all(&report).context("writing report")?;
    out.write_all(b"\n").context("writing report")?;
    Ok(())
}
