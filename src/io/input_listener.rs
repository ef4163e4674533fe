//! Keyboard and pointer listener
//!
//! Global input hook through `rdev::listen`. The hook blocks its thread and
//! cannot be unregistered, so it runs on a dedicated OS thread for the rest
//! of the process; after `close` it keeps discarding events. Key presses,
//! button presses, pointer motion and wheel turns count as activity.
//!
//! Needs a display server on Linux and the accessibility permission on
//! macOS. Without them the hook fails at startup and the source reports
//! itself unavailable.

use crate::domain::types::ActivityEvent;
use crate::infra::clock::MonotonicClock;
use crate::infra::metrics::Metrics;
use crate::services::aggregator::ActivityAggregator;
use crate::services::sensor::{
    ActivityThrottle, SensorError, SensorSignal, SensorSource, SignalForwarder,
};
use async_trait::async_trait;
use rdev::{listen, Event, EventType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

pub const LISTENER_TAG: &str = "input:listener";

/// Pointer motion arrives in bursts of hundreds per second
const COALESCE_GAP: Duration = Duration::from_millis(50);
const LISTENER_CHANNEL_CAPACITY: usize = 64;
/// A hook that cannot start fails well inside this window
const STARTUP_WINDOW: Duration = Duration::from_millis(300);

pub fn is_user_input(event_type: &EventType) -> bool {
    matches!(
        event_type,
        EventType::KeyPress(_)
            | EventType::ButtonPress(_)
            | EventType::MouseMove { .. }
            | EventType::Wheel { .. }
    )
}

/// Turns hook callbacks into activity reports
struct HookHandler {
    forwarder: SignalForwarder,
    throttle: ActivityThrottle,
    clock: MonotonicClock,
    open: bool,
}

impl HookHandler {
    fn new(forwarder: SignalForwarder, clock: MonotonicClock) -> Self {
        Self { forwarder, throttle: ActivityThrottle::new(COALESCE_GAP), clock, open: true }
    }

    fn handle(&mut self, event_type: &EventType) {
        if !self.open || !is_user_input(event_type) {
            return;
        }
        let now = self.clock.now();
        if !self.throttle.admit(now) {
            self.forwarder.touch(LISTENER_TAG, now);
            return;
        }
        if !self.forwarder.forward(SensorSignal::Activity(ActivityEvent::new(LISTENER_TAG, now))) {
            debug!("input_listener_detached");
            self.open = false;
        }
    }
}

pub struct InputListenerSource {
    clock: MonotonicClock,
    aggregator: Arc<ActivityAggregator>,
    metrics: Arc<Metrics>,
    rx: Option<mpsc::Receiver<SensorSignal>>,
    failed: Option<oneshot::Receiver<String>>,
}

impl InputListenerSource {
    pub fn new(
        clock: MonotonicClock,
        aggregator: Arc<ActivityAggregator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { clock, aggregator, metrics, rx: None, failed: None }
    }

    fn unavailable(reason: String) -> SensorError {
        SensorError::Unavailable { source_tag: LISTENER_TAG.to_string(), reason }
    }
}

fn spawn_hook(mut handler: HookHandler, failed: oneshot::Sender<String>) -> std::io::Result<()> {
    std::thread::Builder::new().name("fingerlock-input".to_string()).spawn(move || {
        let result = listen(move |event: Event| handler.handle(&event.event_type));
        let reason = match result {
            Ok(()) => "input hook returned".to_string(),
            Err(e) => format!("input hook failed: {:?}", e),
        };
        error!(reason = %reason, "input_listener_stopped");
        let _ = failed.send(reason);
    })?;
    Ok(())
}

#[async_trait]
impl SensorSource for InputListenerSource {
    fn tag(&self) -> &str {
        LISTENER_TAG
    }

    async fn subscribe(&mut self) -> Result<(), SensorError> {
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        let (failed_tx, mut failed_rx) = oneshot::channel();
        let forwarder = SignalForwarder::new(tx, self.aggregator.clone(), self.metrics.clone());
        spawn_hook(HookHandler::new(forwarder, self.clock), failed_tx)?;

        match tokio::time::timeout(STARTUP_WINDOW, &mut failed_rx).await {
            Ok(Ok(reason)) => return Err(Self::unavailable(reason)),
            Ok(Err(_)) => return Err(Self::unavailable("input hook thread exited".to_string())),
            Err(_) => {}
        }

        info!("input_listener_attached");
        self.rx = Some(rx);
        self.failed = Some(failed_rx);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<SensorSignal>, SensorError> {
        let (Some(rx), Some(failed)) = (self.rx.as_mut(), self.failed.as_mut()) else {
            return Ok(None);
        };

        let reason = tokio::select! {
            Some(signal) = rx.recv() => return Ok(Some(signal)),
            result = failed => result.unwrap_or_else(|_| "input hook thread exited".to_string()),
        };
        self.rx = None;
        self.failed = None;
        Err(Self::unavailable(reason))
    }

    async fn close(&mut self) {
        self.rx = None;
        self.failed = None;
        info!("input_listener_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Timestamp;
    use rdev::{Button, Key};

    fn handler() -> (HookHandler, mpsc::Receiver<SensorSignal>, Arc<ActivityAggregator>) {
        let (tx, rx) = mpsc::channel(8);
        let aggregator = Arc::new(ActivityAggregator::new(Timestamp::ZERO));
        let forwarder = SignalForwarder::new(tx, aggregator.clone(), Arc::new(Metrics::new()));
        (HookHandler::new(forwarder, MonotonicClock::new()), rx, aggregator)
    }

    #[test]
    fn test_user_input_events() {
        assert!(is_user_input(&EventType::KeyPress(Key::KeyA)));
        assert!(is_user_input(&EventType::ButtonPress(Button::Left)));
        assert!(is_user_input(&EventType::MouseMove { x: 10.0, y: 20.0 }));
        assert!(is_user_input(&EventType::Wheel { delta_x: 0, delta_y: -1 }));
        assert!(!is_user_input(&EventType::KeyRelease(Key::KeyA)));
        assert!(!is_user_input(&EventType::ButtonRelease(Button::Left)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_coalesces_motion_bursts() {
        let (mut handler, mut rx, aggregator) = handler();

        tokio::time::advance(Duration::from_millis(1_000)).await;
        handler.handle(&EventType::KeyPress(Key::KeyA));
        handler.handle(&EventType::KeyRelease(Key::KeyA));
        tokio::time::advance(Duration::from_millis(20)).await;
        handler.handle(&EventType::MouseMove { x: 1.0, y: 1.0 });

        match rx.try_recv().unwrap() {
            SensorSignal::Activity(event) => {
                assert_eq!(event.source_tag, LISTENER_TAG);
                assert_eq!(event.timestamp, Timestamp::from_millis(1_000));
            }
            other => panic!("unexpected signal {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        // Merged motion still moved the clock
        assert_eq!(aggregator.last_activity(), Timestamp::from_millis(1_020));

        tokio::time::advance(Duration::from_millis(60)).await;
        handler.handle(&EventType::ButtonPress(Button::Left));
        assert!(matches!(rx.try_recv(), Ok(SensorSignal::Activity(_))));
    }

    #[tokio::test]
    async fn test_handler_goes_quiet_after_close() {
        let (mut handler, rx, _aggregator) = handler();
        drop(rx);

        handler.handle(&EventType::KeyPress(Key::KeyA));
        assert!(!handler.open);
    }
}
