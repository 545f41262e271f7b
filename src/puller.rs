//! Pull-based data delivery.
//!
//! Producers see pulls only through the [`Puller`] trait. [`PullerManager`]
//! is the concrete implementation: it owns the data sources per tag, keeps a
//! schedule of registered receivers and delivers pulled batches when alarms
//! fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::HealthMetrics;
use crate::sample::Sample;

/// Errors returned by a pull.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    #[error("no data source registered for tag {tag}")]
    UnknownTag { tag: u32 },

    #[error("pull for tag {tag} failed: {reason}")]
    SourceFailed { tag: u32, reason: String },
}

/// Receives scheduled pull results. Ownership of the batch is transferred.
pub trait PullDataReceiver: Send + Sync {
    fn on_data_pulled(&self, data: Vec<Sample>);
}

/// Produces the current readings for a tag.
pub trait PullSource: Send + Sync {
    fn pull(&self, tag: u32) -> Result<Vec<Sample>, PullError>;
}

impl<F> PullSource for F
where
    F: Fn(u32) -> Result<Vec<Sample>, PullError> + Send + Sync,
{
    fn pull(&self, tag: u32) -> Result<Vec<Sample>, PullError> {
        self(tag)
    }
}

/// Pull service injected into producers.
pub trait Puller: Send + Sync {
    /// Schedules `receiver` for pulls of `tag` starting at `first_pull_ns`,
    /// then every `interval_ns`.
    fn register_receiver(
        &self,
        tag: u32,
        receiver: Weak<dyn PullDataReceiver>,
        first_pull_ns: u64,
        interval_ns: u64,
    );

    fn unregister_receiver(&self, tag: u32, receiver: &Weak<dyn PullDataReceiver>);

    /// Pulls `tag` immediately.
    fn pull(&self, tag: u32) -> Result<Vec<Sample>, PullError>;
}

struct ReceiverEntry {
    receiver: Weak<dyn PullDataReceiver>,
    next_pull_ns: u64,
    interval_ns: u64,
}

/// Tag-keyed sources and receiver schedule.
pub struct PullerManager {
    sources: DashMap<u32, Arc<dyn PullSource>>,
    receivers: DashMap<u32, Vec<ReceiverEntry>>,
    health: Option<Arc<HealthMetrics>>,
    running: AtomicBool,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for PullerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullerManager")
            .field("sources", &self.sources.len())
            .field("receivers", &self.receivers.len())
            .finish()
    }
}

impl Default for PullerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PullerManager {
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
            receivers: DashMap::new(),
            health: None,
            running: AtomicBool::new(false),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Reports pull failures and deliveries to `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Registers the data source for `tag`, replacing any previous one.
    pub fn add_source(&self, tag: u32, source: Arc<dyn PullSource>) {
        self.sources.insert(tag, source);
    }

    /// Number of live receivers registered for `tag`.
    pub fn receiver_count(&self, tag: u32) -> usize {
        self.receivers.get(&tag).map_or(0, |entries| {
            entries
                .iter()
                .filter(|e| e.receiver.strong_count() > 0)
                .count()
        })
    }

    /// Earliest scheduled pull time across receivers of `tag`.
    pub fn next_pull_ns(&self, tag: u32) -> Option<u64> {
        self.receivers
            .get(&tag)
            .and_then(|entries| entries.iter().map(|e| e.next_pull_ns).min())
    }

    /// Pulls each tag with due receivers once and delivers a copy of the
    /// batch to every due receiver. Returns the number of deliveries.
    pub fn on_alarm_fired(&self, now_ns: u64) -> usize {
        let mut due: Vec<(u32, Vec<Arc<dyn PullDataReceiver>>)> = Vec::new();

        for mut entry in self.receivers.iter_mut() {
            let tag = *entry.key();
            let entries = entry.value_mut();
            entries.retain(|e| e.receiver.strong_count() > 0);

            let mut ready = Vec::new();
            for e in entries.iter_mut() {
                if e.next_pull_ns > now_ns {
                    continue;
                }
                if let Some(receiver) = e.receiver.upgrade() {
                    ready.push(receiver);
                }
                let missed = (now_ns - e.next_pull_ns) / e.interval_ns;
                e.next_pull_ns += (missed + 1) * e.interval_ns;
            }

            if !ready.is_empty() {
                due.push((tag, ready));
            }
        }
        self.receivers.retain(|_, entries| !entries.is_empty());

        // Registry guards are released; receivers may unregister while handling.
        let mut delivered = 0;
        for (tag, receivers) in due {
            let Ok(data) = self.pull(tag) else {
                continue;
            };

            debug!(tag, samples = data.len(), receivers = receivers.len(), "delivering pull");
            for receiver in receivers {
                receiver.on_data_pulled(data.clone());
                delivered += 1;
            }

            if let Some(health) = &self.health {
                health
                    .pulls_delivered
                    .with_label_values(&[&tag.to_string()])
                    .inc();
            }
        }

        delivered
    }

    /// Starts a background task that fires alarms from wall-clock time every
    /// `tick`.
    pub fn start(self: &Arc<Self>, tick: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running.
        }

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());
        let manager = Arc::clone(self);

        info!(?tick, "puller started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("puller stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        manager.on_alarm_fired(wall_clock_ns());
                    }
                }
            }
        });
    }

    /// Stops the background task.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Puller for PullerManager {
    fn register_receiver(
        &self,
        tag: u32,
        receiver: Weak<dyn PullDataReceiver>,
        first_pull_ns: u64,
        interval_ns: u64,
    ) {
        debug!(tag, first_pull_ns, interval_ns, "receiver registered");
        self.receivers.entry(tag).or_default().push(ReceiverEntry {
            receiver,
            next_pull_ns: first_pull_ns,
            interval_ns: interval_ns.max(1),
        });
    }

    fn unregister_receiver(&self, tag: u32, receiver: &Weak<dyn PullDataReceiver>) {
        if let Some(mut entries) = self.receivers.get_mut(&tag) {
            entries.retain(|e| !Weak::ptr_eq(&e.receiver, receiver));
            debug!(tag, remaining = entries.len(), "receiver unregistered");
        }
        self.receivers.remove_if(&tag, |_, entries| entries.is_empty());
    }

    fn pull(&self, tag: u32) -> Result<Vec<Sample>, PullError> {
        let source = self.sources.get(&tag).map(|s| Arc::clone(s.value()));

        let result = match source {
            Some(source) => source.pull(tag),
            None => Err(PullError::UnknownTag { tag }),
        };

        if let Err(e) = &result {
            warn!(tag, error = %e, "pull failed");
            if let Some(health) = &self.health {
                health
                    .pull_failures
                    .with_label_values(&[&tag.to_string()])
                    .inc();
            }
        }

        result
    }
}

/// Nanoseconds since the Unix epoch.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::dimension::{DimensionKey, FieldValue};

    #[derive(Default)]
    struct Recorder {
        batches: parking_lot::Mutex<Vec<Vec<Sample>>>,
    }

    impl PullDataReceiver for Recorder {
        fn on_data_pulled(&self, data: Vec<Sample>) {
            self.batches.lock().push(data);
        }
    }

    fn weak(recorder: &Arc<Recorder>) -> Weak<dyn PullDataReceiver> {
        let receiver: Arc<dyn PullDataReceiver> = recorder.clone();
        Arc::downgrade(&receiver)
    }

    fn manager_with_source(calls: Arc<AtomicUsize>) -> PullerManager {
        let manager = PullerManager::new();
        manager.add_source(
            7,
            Arc::new(move |_tag: u32| -> Result<Vec<Sample>, PullError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![Sample::new(
                    DimensionKey::default(),
                    5,
                    vec![FieldValue::Int(42)],
                )])
            }),
        );
        manager
    }

    #[test]
    fn test_alarm_delivers_to_due_receivers_once_per_tag() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = manager_with_source(Arc::clone(&calls));
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        manager.register_receiver(7, weak(&a), 100, 50);
        manager.register_receiver(7, weak(&b), 100, 50);

        assert_eq!(manager.on_alarm_fired(99), 0);
        assert_eq!(manager.on_alarm_fired(100), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.batches.lock().len(), 1);
        assert_eq!(b.batches.lock()[0][0].long(1), Some(42));
        assert_eq!(manager.next_pull_ns(7), Some(150));
    }

    #[test]
    fn test_missed_alarms_schedule_past_now() {
        let manager = manager_with_source(Arc::new(AtomicUsize::new(0)));
        let r = Arc::new(Recorder::default());
        manager.register_receiver(7, weak(&r), 100, 50);

        assert_eq!(manager.on_alarm_fired(260), 1);
        assert_eq!(manager.next_pull_ns(7), Some(300));
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let manager = manager_with_source(Arc::new(AtomicUsize::new(0)));
        let r = Arc::new(Recorder::default());
        manager.register_receiver(7, weak(&r), 0, 10);
        assert_eq!(manager.receiver_count(7), 1);

        drop(r);
        assert_eq!(manager.receiver_count(7), 0);
        assert_eq!(manager.on_alarm_fired(10), 0);
        assert_eq!(manager.next_pull_ns(7), None);
    }

    #[test]
    fn test_unregister_receiver() {
        let manager = manager_with_source(Arc::new(AtomicUsize::new(0)));
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let weak_a = weak(&a);
        manager.register_receiver(7, weak_a.clone(), 0, 10);
        manager.register_receiver(7, weak(&b), 0, 10);

        manager.unregister_receiver(7, &weak_a);
        assert_eq!(manager.receiver_count(7), 1);
        assert_eq!(manager.on_alarm_fired(0), 1);
        assert!(a.batches.lock().is_empty());
    }

    #[test]
    fn test_pull_failure_is_counted_and_not_delivered() {
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let manager = PullerManager::new().with_health(Arc::clone(&health));
        manager.add_source(
            3,
            Arc::new(|tag: u32| -> Result<Vec<Sample>, PullError> {
                Err(PullError::SourceFailed {
                    tag,
                    reason: "device busy".to_string(),
                })
            }),
        );
        let r = Arc::new(Recorder::default());
        manager.register_receiver(3, weak(&r), 0, 10);

        assert_eq!(manager.on_alarm_fired(0), 0);
        assert!(r.batches.lock().is_empty());
        assert_eq!(health.pull_failures.with_label_values(&["3"]).get(), 1.0);
    }

    #[test]
    fn test_pull_unknown_tag() {
        let manager = PullerManager::new();
        let err = manager.pull(99).unwrap_err();
        assert_eq!(err, PullError::UnknownTag { tag: 99 });
        assert!(err.to_string().contains("tag 99"));
    }

    #[tokio::test]
    async fn test_background_alarms_deliver() {
        let manager = Arc::new(manager_with_source(Arc::new(AtomicUsize::new(0))));
        let r = Arc::new(Recorder::default());
        manager.register_receiver(7, weak(&r), 0, 1);

        manager.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop();

        let delivered = r.batches.lock().len();
        assert!(delivered >= 1, "expected deliveries, got {delivered}");
    }
}
