//! Sensor sources and their supervisor
//!
//! Every backend (keyboard/pointer listener, raw input devices, recognizer
//! feed, scripted replay) implements `SensorSource`. The supervisor attaches
//! each one, runs it on its own task and forwards what it reports into the
//! `ActivityAggregator`. Sensor tasks never touch the lock session.

use crate::domain::types::{ActivityEvent, LogCategory, Timestamp};
use crate::infra::clock::MonotonicClock;
use crate::infra::logging::{EventSink, SharedSink};
use crate::infra::metrics::Metrics;
use crate::services::aggregator::ActivityAggregator;
use crate::services::monitor::MonitorError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {source_tag} unavailable: {reason}")]
    Unavailable { source_tag: String, reason: String },
    #[error("sensor io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SensorError {
    /// Cause without the source tag, for messages that already name the source
    pub fn reason(&self) -> String {
        match self {
            SensorError::Unavailable { reason, .. } => reason.clone(),
            SensorError::Io(e) => e.to_string(),
        }
    }
}

/// What a sensor can report
#[derive(Debug, Clone, PartialEq)]
pub enum SensorSignal {
    /// Plain input activity (key, pointer, motion)
    Activity(ActivityEvent),
    /// A recognizer saw the user; counts as activity
    Presence { event: ActivityEvent, detail: Option<String> },
    /// A recognizer lost the user; logged only, never moves the activity clock
    Absence { source_tag: String, detail: Option<String> },
}

/// Pluggable producer of activity signals
///
/// `poll` must be cancel-safe: the supervisor races it against shutdown.
#[async_trait]
pub trait SensorSource: Send {
    fn tag(&self) -> &str;

    /// Acquire devices or listeners. Failure means the source is skipped.
    async fn subscribe(&mut self) -> Result<(), SensorError>;

    /// Next signal, `Ok(None)` once the source has nothing more to report
    async fn poll(&mut self) -> Result<Option<SensorSignal>, SensorError>;

    /// Release devices or listeners
    async fn close(&mut self);
}

/// Hands signals from reader tasks to their source's channel
///
/// A full channel never costs lock timing: the timestamp of an activity or
/// presence signal that does not fit goes straight into the aggregator.
/// Only the presence detail or an absence report is lost.
#[derive(Clone)]
pub struct SignalForwarder {
    tx: mpsc::Sender<SensorSignal>,
    aggregator: Arc<ActivityAggregator>,
    metrics: Arc<Metrics>,
}

impl SignalForwarder {
    pub fn new(
        tx: mpsc::Sender<SensorSignal>,
        aggregator: Arc<ActivityAggregator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { tx, aggregator, metrics }
    }

    /// Returns false once the receiving source is gone
    pub fn forward(&self, signal: SensorSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                self.metrics.record_signal_overflow();
                match signal {
                    SensorSignal::Activity(event) | SensorSignal::Presence { event, .. } => {
                        self.aggregator.record_activity(&event.source_tag, event.timestamp);
                        self.metrics.record_activity();
                        debug!(source = %event.source_tag, "sensor_channel_full");
                    }
                    SensorSignal::Absence { source_tag, .. } => {
                        debug!(source = %source_tag, "sensor_channel_full_absence_lost");
                    }
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Move the activity clock without a report, for events a recent report covers
    pub fn touch(&self, source_tag: &str, at: Timestamp) {
        self.aggregator.record_activity(source_tag, at);
    }
}

/// Merges activity reports closer together than `gap`
#[derive(Debug)]
pub struct ActivityThrottle {
    gap: Duration,
    last: Option<Timestamp>,
}

impl ActivityThrottle {
    pub fn new(gap: Duration) -> Self {
        Self { gap, last: None }
    }

    /// Whether a report at `now` should be sent rather than merged
    pub fn admit(&mut self, now: Timestamp) -> bool {
        if self.last.is_some_and(|last| now.saturating_since(last) < self.gap) {
            return false;
        }
        self.last = Some(now);
        true
    }
}

/// Running sensor tasks
pub struct SensorSupervisor {
    attached: Vec<String>,
    handles: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
    lost: Arc<AtomicBool>,
}

impl SensorSupervisor {
    /// Sources that attached at startup
    pub fn attached(&self) -> &[String] {
        &self.attached
    }

    /// Sources still running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the last source stopped before shutdown was requested
    pub fn all_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Wait for every sensor task to finish (after shutdown)
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Attach every source and spawn one task per attached source
///
/// Sources that fail to attach are logged and dropped. Fails only when
/// no source could be attached. Once running, losing the last source logs
/// `NoSensors` and raises `shutdown`.
pub async fn spawn_sensors(
    sources: Vec<Box<dyn SensorSource>>,
    aggregator: Arc<ActivityAggregator>,
    sink: SharedSink,
    metrics: Arc<Metrics>,
    shutdown: watch::Sender<bool>,
) -> Result<SensorSupervisor, MonitorError> {
    let mut attached = Vec::new();
    let mut ready = Vec::new();

    for mut source in sources {
        let tag = source.tag().to_string();
        match source.subscribe().await {
            Ok(()) => {
                info!(source = %tag, "sensor_attached");
                sink.record(LogCategory::System, &format!("Sensor {} attached", tag));
                attached.push(tag);
                ready.push(source);
            }
            Err(e) => {
                sink.record(
                    LogCategory::Error,
                    &format!("Sensor {} unavailable: {}", tag, e.reason()),
                );
            }
        }
    }

    if ready.is_empty() {
        return Err(MonitorError::NoSensors);
    }

    // Counted before any task starts so an early exit cannot hit zero
    let active = Arc::new(AtomicUsize::new(ready.len()));
    let lost = Arc::new(AtomicBool::new(false));
    let handles = ready
        .into_iter()
        .map(|source| {
            let task = SourceTask {
                aggregator: aggregator.clone(),
                sink: sink.clone(),
                metrics: metrics.clone(),
                active: active.clone(),
                lost: lost.clone(),
                shutdown: shutdown.clone(),
            };
            tokio::spawn(task.run(source))
        })
        .collect();

    Ok(SensorSupervisor { attached, handles, active, lost })
}

struct SourceTask {
    aggregator: Arc<ActivityAggregator>,
    sink: SharedSink,
    metrics: Arc<Metrics>,
    active: Arc<AtomicUsize>,
    lost: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl SourceTask {
    async fn run(self, mut source: Box<dyn SensorSource>) {
        let mut stop = self.shutdown.subscribe();

        while !*stop.borrow_and_update() {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = source.poll() => match result {
                    Ok(Some(signal)) => {
                        apply_signal(signal, &self.aggregator, self.sink.as_ref(), &self.metrics)
                    }
                    Ok(None) => {
                        info!(source = %source.tag(), "sensor_exhausted");
                        break;
                    }
                    Err(e) => {
                        self.sink.record(
                            LogCategory::Error,
                            &format!("Sensor {} stopped: {}", source.tag(), e.reason()),
                        );
                        break;
                    }
                }
            }
        }

        let stopping = *stop.borrow();
        source.close().await;
        info!(source = %source.tag(), "sensor_closed");

        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && !stopping {
            self.lost.store(true, Ordering::Release);
            error!(error = %MonitorError::NoSensors, "sensors_lost");
            self.sink.record(
                LogCategory::Error,
                &format!("Stopping monitoring: {}", MonitorError::NoSensors),
            );
            let _ = self.shutdown.send(true);
        }
    }
}

/// Route one signal into the aggregator and the event sink
pub fn apply_signal(
    signal: SensorSignal,
    aggregator: &ActivityAggregator,
    sink: &dyn EventSink,
    metrics: &Metrics,
) {
    match signal {
        SensorSignal::Activity(event) => {
            aggregator.record_activity(&event.source_tag, event.timestamp);
            metrics.record_activity();
        }
        SensorSignal::Presence { event, detail } => {
            aggregator.record_activity(&event.source_tag, event.timestamp);
            metrics.record_activity();
            let message = match detail {
                Some(detail) => format!("Presence detected by {}: {}", event.source_tag, detail),
                None => format!("Presence detected by {}", event.source_tag),
            };
            sink.record(LogCategory::Presence, &message);
        }
        SensorSignal::Absence { source_tag, detail } => {
            let message = match detail {
                Some(detail) => format!("Absence reported by {}: {}", source_tag, detail),
                None => format!("Absence reported by {}", source_tag),
            };
            sink.record(LogCategory::Absence, &message);
        }
    }
}

/// What a `ScriptedSource` does once its steps run out
#[derive(Debug, Clone, PartialEq)]
enum ScriptEnd {
    /// Stay attached and quiet until shutdown
    Idle,
    /// Report `Ok(None)`
    Exhausted,
    /// Report an io error
    Fail(String),
}

/// Replays a fixed list of activity reports
///
/// Each step waits its delay (relative to the previous step) and then
/// reports activity stamped with the current clock. After the last step
/// the source stays quiet, like a keyboard nobody touches.
pub struct ScriptedSource {
    tag: String,
    clock: MonotonicClock,
    steps: VecDeque<Duration>,
    deadline: Option<Instant>,
    attachable: bool,
    end: ScriptEnd,
}

impl ScriptedSource {
    pub fn new(tag: impl Into<String>, clock: MonotonicClock, delays: Vec<Duration>) -> Self {
        Self {
            tag: tag.into(),
            clock,
            steps: delays.into(),
            deadline: None,
            attachable: true,
            end: ScriptEnd::Idle,
        }
    }

    /// A source whose `subscribe` always fails
    pub fn unavailable(tag: impl Into<String>) -> Self {
        Self {
            attachable: false,
            ..Self::new(tag, MonotonicClock::new(), Vec::new())
        }
    }

    /// End the source after the last step
    pub fn exhausted_after(mut self) -> Self {
        self.end = ScriptEnd::Exhausted;
        self
    }

    /// Fail with `reason` after the last step
    pub fn failing_after(mut self, reason: impl Into<String>) -> Self {
        self.end = ScriptEnd::Fail(reason.into());
        self
    }
}

#[async_trait]
impl SensorSource for ScriptedSource {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn subscribe(&mut self) -> Result<(), SensorError> {
        if self.attachable {
            Ok(())
        } else {
            Err(SensorError::Unavailable {
                source_tag: self.tag.clone(),
                reason: "scripted failure".to_string(),
            })
        }
    }

    async fn poll(&mut self) -> Result<Option<SensorSignal>, SensorError> {
        let Some(&delay) = self.steps.front() else {
            return match &self.end {
                ScriptEnd::Idle => std::future::pending().await,
                ScriptEnd::Exhausted => Ok(None),
                ScriptEnd::Fail(reason) => Err(SensorError::Io(std::io::Error::other(reason.clone()))),
            };
        };
        // Deadline survives cancellation so a step is not restarted
        let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + delay);
        tokio::time::sleep_until(deadline).await;

        self.steps.pop_front();
        self.deadline = None;
        debug!(source = %self.tag, "scripted_activity");
        Ok(Some(SensorSignal::Activity(ActivityEvent::new(self.tag.clone(), self.clock.now()))))
    }

    async fn close(&mut self) {
        self.steps.clear();
        self.deadline = None;
        self.end = ScriptEnd::Exhausted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Timestamp;
    use crate::infra::logging::RecordingSink;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_apply_signal_absence_does_not_move_clock() {
        let aggregator = ActivityAggregator::new(Timestamp::from_millis(100));
        let sink = RecordingSink::new();
        let metrics = Metrics::new();

        apply_signal(
            SensorSignal::Absence { source_tag: "feed:face".into(), detail: None },
            &aggregator,
            &sink,
            &metrics,
        );
        assert_eq!(aggregator.last_activity(), Timestamp::from_millis(100));
        assert_eq!(sink.count(LogCategory::Absence), 1);

        apply_signal(
            SensorSignal::Presence {
                event: ActivityEvent::new("feed:face", Timestamp::from_millis(900)),
                detail: Some("owner".into()),
            },
            &aggregator,
            &sink,
            &metrics,
        );
        assert_eq!(aggregator.last_activity(), Timestamp::from_millis(900));
        assert_eq!(sink.count(LogCategory::Presence), 1);
        assert_eq!(metrics.activity_total(), 1);
    }

    #[test]
    fn test_forwarder_applies_activity_when_channel_full() {
        let aggregator = Arc::new(ActivityAggregator::new(Timestamp::ZERO));
        let metrics = Arc::new(Metrics::new());
        let (tx, mut rx) = mpsc::channel(1);
        let forwarder = SignalForwarder::new(tx, aggregator.clone(), metrics.clone());

        let first = SensorSignal::Activity(ActivityEvent::new("keys", Timestamp::from_millis(10)));
        assert!(forwarder.forward(first.clone()));
        assert_eq!(aggregator.last_activity(), Timestamp::ZERO);

        // Newest event does not fit but still moves the clock
        assert!(forwarder.forward(SensorSignal::Activity(ActivityEvent::new(
            "keys",
            Timestamp::from_millis(20),
        ))));
        assert!(forwarder.forward(SensorSignal::Presence {
            event: ActivityEvent::new("feed:face", Timestamp::from_millis(30)),
            detail: None,
        }));
        assert!(forwarder.forward(SensorSignal::Absence {
            source_tag: "feed:face".into(),
            detail: None,
        }));
        assert_eq!(aggregator.last_activity(), Timestamp::from_millis(30));
        assert_eq!(metrics.signals_overflowed(), 3);
        assert_eq!(metrics.activity_total(), 2);

        assert_eq!(rx.try_recv().unwrap(), first);
        drop(rx);
        assert!(!forwarder.forward(SensorSignal::Activity(ActivityEvent::new(
            "keys",
            Timestamp::from_millis(40),
        ))));
    }

    #[test]
    fn test_throttle_merges_bursts() {
        let mut throttle = ActivityThrottle::new(ms(50));
        assert!(throttle.admit(Timestamp::from_millis(1_000)));
        assert!(!throttle.admit(Timestamp::from_millis(1_020)));
        assert!(!throttle.admit(Timestamp::from_millis(1_049)));
        assert!(throttle.admit(Timestamp::from_millis(1_050)));
        assert!(!throttle.admit(Timestamp::from_millis(1_080)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_skips_unavailable_sources() {
        let clock = MonotonicClock::new();
        let aggregator = Arc::new(ActivityAggregator::new(clock.now()));
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let sources: Vec<Box<dyn SensorSource>> = vec![
            Box::new(ScriptedSource::unavailable("camera")),
            Box::new(ScriptedSource::new("keyboard", clock, vec![ms(500), ms(500)])),
        ];

        let supervisor = spawn_sensors(
            sources,
            aggregator.clone(),
            sink.clone(),
            metrics.clone(),
            shutdown_tx.clone(),
        )
        .await
        .unwrap();
        assert_eq!(supervisor.attached(), ["keyboard".to_string()]);
        assert_eq!(
            sink.entries()
                .into_iter()
                .filter(|(category, _)| *category == LogCategory::Error)
                .collect::<Vec<_>>(),
            vec![(LogCategory::Error, "Sensor camera unavailable: scripted failure".to_string())]
        );

        tokio::time::sleep(ms(1_100)).await;
        let last = aggregator.last_activity().as_millis();
        assert!((1_000..1_100).contains(&last), "last activity at {last}ms");
        assert_eq!(metrics.activity_total(), 2);

        // A quiet keyboard stays attached
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(supervisor.active(), 1);

        let _ = shutdown_tx.send(true);
        supervisor.join().await;
    }

    #[tokio::test]
    async fn test_supervisor_fails_without_sensors() {
        let aggregator = Arc::new(ActivityAggregator::new(Timestamp::ZERO));
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let sources: Vec<Box<dyn SensorSource>> =
            vec![Box::new(ScriptedSource::unavailable("camera"))];

        let result = spawn_sensors(
            sources,
            aggregator,
            Arc::new(RecordingSink::new()),
            Arc::new(Metrics::new()),
            shutdown_tx,
        )
        .await;
        assert!(matches!(result, Err(MonitorError::NoSensors)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_last_sensor_raises_shutdown() {
        let clock = MonotonicClock::new();
        let sink = Arc::new(RecordingSink::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let sources: Vec<Box<dyn SensorSource>> = vec![Box::new(
            ScriptedSource::new("only-sensor", clock, vec![ms(500)]).failing_after("device unplugged"),
        )];

        let supervisor = spawn_sensors(
            sources,
            Arc::new(ActivityAggregator::new(clock.now())),
            sink.clone(),
            Arc::new(Metrics::new()),
            shutdown_tx,
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), shutdown_rx.changed())
            .await
            .expect("shutdown raised")
            .unwrap();
        assert!(*shutdown_rx.borrow());
        assert_eq!(supervisor.active(), 0);
        assert!(supervisor.all_lost());

        let errors: Vec<String> = sink
            .entries()
            .into_iter()
            .filter(|(category, _)| *category == LogCategory::Error)
            .map(|(_, message)| message)
            .collect();
        assert_eq!(
            errors,
            vec![
                "Sensor only-sensor stopped: device unplugged".to_string(),
                format!("Stopping monitoring: {}", MonitorError::NoSensors),
            ]
        );
        supervisor.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_one_of_two_sensors_keeps_running() {
        let clock = MonotonicClock::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sources: Vec<Box<dyn SensorSource>> = vec![
            Box::new(ScriptedSource::new("feed", clock, vec![ms(100)]).exhausted_after()),
            Box::new(ScriptedSource::new("keyboard", clock, vec![ms(300)])),
        ];

        let supervisor = spawn_sensors(
            sources,
            Arc::new(ActivityAggregator::new(clock.now())),
            Arc::new(RecordingSink::new()),
            Arc::new(Metrics::new()),
            shutdown_tx.clone(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(supervisor.active(), 1);
        assert!(!*shutdown_rx.borrow());

        // Requested shutdown is not a loss
        let _ = shutdown_tx.send(true);
        tokio::time::sleep(ms(10)).await;
        assert_eq!(supervisor.active(), 0);
        assert!(!supervisor.all_lost());
        supervisor.join().await;
    }
}
