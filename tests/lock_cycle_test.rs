//! End-to-end lock cycles: scripted sensors and gestures driving the monitor
//!
//! All tests run on paused tokio time, so second-long lock delays finish
//! instantly and deterministically.

use async_trait::async_trait;
use fingerlock::domain::{LockState, LogCategory, Pattern, PlatformSetting, PointerEvent};
use fingerlock::infra::{Metrics, MonotonicClock, RecordingSink};
use fingerlock::io::{read_status, StatusSnapshot, StatusWriter};
use fingerlock::services::gesture::{enroll_pattern, EnrollNotice};
use fingerlock::services::sensor::SensorSupervisor;
use fingerlock::services::{
    spawn_sensors, ActivityAggregator, CaptureConfig, Credential, CredentialStore,
    FileCredentialStore, LockMachine, LockOutcome, MachineConfig, Monitor, MonitorError,
    ScriptedSource, ScriptedSurface, SensorSource, SessionLocker, ZoneGrid,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DWELL: Duration = Duration::from_millis(200);

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn grid() -> ZoneGrid {
    ZoneGrid::new(300.0, 300.0)
}

#[derive(Default)]
struct CountingLocker {
    calls: AtomicUsize,
}

impl CountingLocker {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionLocker for CountingLocker {
    async fn lock(&self, _platform: PlatformSetting) -> LockOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        LockOutcome::Success { command: "test-lock".to_string() }
    }
}

struct Rig {
    clock: MonotonicClock,
    aggregator: Arc<ActivityAggregator>,
    sink: Arc<RecordingSink>,
    metrics: Arc<Metrics>,
    locker: Arc<CountingLocker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Rig {
    fn new() -> Self {
        let clock = MonotonicClock::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            clock,
            aggregator: Arc::new(ActivityAggregator::new(clock.now())),
            sink: Arc::new(RecordingSink::new()),
            metrics: Arc::new(Metrics::new()),
            locker: Arc::new(CountingLocker::default()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Keyboard activity at 0.5s and 4.0s, then quiet
    async fn keyboard(&self) -> SensorSupervisor {
        self.sensors(ScriptedSource::new("test:keyboard", self.clock, vec![ms(500), ms(3500)]))
            .await
    }

    async fn sensors(&self, source: ScriptedSource) -> SensorSupervisor {
        let sources: Vec<Box<dyn SensorSource>> = vec![Box::new(source)];
        spawn_sensors(
            sources,
            self.aggregator.clone(),
            self.sink.clone(),
            self.metrics.clone(),
            self.shutdown_tx.clone(),
        )
        .await
        .unwrap()
    }

    /// Lock delay 2s, credential `7-5-3`
    fn monitor(&self, surface: ScriptedSurface) -> Monitor {
        let config = MachineConfig {
            lock_delay: Duration::from_secs(2),
            platform: PlatformSetting::Linux,
            ..MachineConfig::default()
        };
        let machine = LockMachine::new(
            config,
            self.aggregator.clone(),
            self.locker.clone(),
            Credential::from_pattern(&Pattern::parse("7-5-3").unwrap()),
            self.sink.clone(),
            self.metrics.clone(),
            self.clock.now(),
        );
        Monitor::new(
            machine,
            self.clock,
            Box::new(surface),
            CaptureConfig::default(),
            ms(100),
            self.sink.clone(),
        )
    }

    fn shutdown_after(&self, after: Duration) {
        let tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(true);
        });
    }

    fn has(&self, category: LogCategory, message: &str) -> bool {
        self.sink.entries().iter().any(|(c, m)| *c == category && m == message)
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_lock_then_unlock_after_wrong_pattern() {
    let rig = Rig::new();
    let sensors = rig.keyboard().await;

    let mut surface = ScriptedSurface::new(grid());
    surface.push_drag(&[1, 2, 3], DWELL);
    surface.push_drag(&[7, 5, 3], DWELL);

    let monitor = rig.monitor(surface);
    rig.shutdown_after(Duration::from_secs(6));
    let machine = monitor.run(rig.shutdown_rx.clone()).await;
    sensors.join().await;

    assert_eq!(rig.locker.calls(), 1);
    assert_eq!(rig.metrics.attempts_rejected(), 1);
    assert_eq!(rig.metrics.unlocks_total(), 1);
    assert!(rig.has(LogCategory::Lock, "Wrong pattern (attempt 1/3)"));
    assert!(rig.has(LogCategory::System, "Session unlocked"));
    assert!(rig.sink.count(LogCategory::Absence) >= 1);

    // Unlocked roughly 1.3s before shutdown, well inside the lock delay
    assert!(matches!(machine.state(), LockState::Active | LockState::Grace));
    assert_eq!(machine.session().attempt_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_challenge_stays_locked_without_counting() {
    let rig = Rig::new();
    let sensors = rig.keyboard().await;

    let mut surface = ScriptedSurface::new(grid());
    let (x, y) = grid().center_of(fingerlock::domain::Zone::new(7).unwrap());
    surface.push(Duration::ZERO, PointerEvent::Press { x, y });
    surface.push(ms(50), PointerEvent::Cancel);

    let monitor = rig.monitor(surface);
    rig.shutdown_after(Duration::from_secs(6));
    let machine = monitor.run(rig.shutdown_rx.clone()).await;
    sensors.join().await;

    assert_eq!(machine.state(), LockState::Locked);
    assert_eq!(machine.session().attempt_count, 0);
    assert_eq!(rig.metrics.attempts_rejected(), 0);
    assert_eq!(rig.locker.calls(), 1);
    assert!(rig.has(LogCategory::System, "Unlock cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_wrong_patterns_lock_out() {
    let rig = Rig::new();
    let sensors = rig.keyboard().await;

    let mut surface = ScriptedSurface::new(grid());
    for _ in 0..3 {
        surface.push_drag(&[1, 2, 3], DWELL);
    }

    let monitor = rig.monitor(surface);
    rig.shutdown_after(Duration::from_secs(8));
    let machine = monitor.run(rig.shutdown_rx.clone()).await;
    sensors.join().await;

    assert_eq!(machine.state(), LockState::Locked);
    assert_eq!(rig.metrics.attempts_rejected(), 3);
    assert_eq!(rig.metrics.lockouts_total(), 1);
    assert_eq!(rig.metrics.unlocks_total(), 0);
    assert!(rig.has(LogCategory::Lock, "Too many failed attempts, input ignored for 30s"));
    // Re-arm policy does not re-issue the OS lock
    assert_eq!(rig.locker.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_file_follows_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status.json");
    let rig = Rig::new();
    let sensors = rig.keyboard().await;

    let monitor = rig
        .monitor(ScriptedSurface::new(grid()))
        .with_status(StatusWriter::new(&path, PlatformSetting::Linux, 2));

    let status_path = path.clone();
    let tx = rig.shutdown_tx.clone();
    let reader = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        let snapshot = read_status(&status_path).unwrap();
        let _ = tx.send(true);
        snapshot
    });

    monitor.run(rig.shutdown_rx.clone()).await;
    sensors.join().await;

    let snapshot: StatusSnapshot = reader.await.unwrap().expect("status written while running");
    assert_eq!(snapshot.state, LockState::Locked);
    assert_eq!(snapshot.platform, PlatformSetting::Linux);
    assert_eq!(snapshot.lock_delay_seconds, 2);
    assert!(read_status(&path).unwrap().is_none());
}

#[tokio::test]
async fn test_no_attachable_sensor_fails() {
    let rig = Rig::new();
    let sources: Vec<Box<dyn SensorSource>> = vec![
        Box::new(ScriptedSource::unavailable("test:camera")),
        Box::new(ScriptedSource::unavailable("test:mouse")),
    ];

    let result = spawn_sensors(
        sources,
        rig.aggregator.clone(),
        rig.sink.clone(),
        rig.metrics.clone(),
        rig.shutdown_tx.clone(),
    )
    .await;

    assert!(matches!(result, Err(MonitorError::NoSensors)));
    assert_eq!(rig.sink.count(LogCategory::Error), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_capture_in_progress() {
    let rig = Rig::new();
    let sensors = rig.keyboard().await;

    // Finger goes down on 7 and stays there well past shutdown
    let mut surface = ScriptedSurface::new(grid());
    let (x, y) = grid().center_of(fingerlock::domain::Zone::new(7).unwrap());
    surface.push(Duration::ZERO, PointerEvent::Press { x, y });
    surface.push(Duration::from_secs(30), PointerEvent::Move { x, y });
    surface.push(ms(10), PointerEvent::Release);

    let monitor = rig.monitor(surface);
    let started = tokio::time::Instant::now();
    rig.shutdown_after(Duration::from_secs(5));
    let machine = monitor.run(rig.shutdown_rx.clone()).await;
    sensors.join().await;

    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(machine.state(), LockState::Authenticating);
    assert_eq!(machine.session().attempt_count, 0);
    assert_eq!(rig.metrics.attempts_rejected(), 0);
    assert_eq!(rig.metrics.unlocks_total(), 0);
    assert!(!rig.has(LogCategory::System, "Unlock cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_losing_only_sensor_stops_monitoring() {
    let rig = Rig::new();
    let sensors = rig
        .sensors(
            ScriptedSource::new("test:keyboard", rig.clock, vec![ms(500)])
                .failing_after("device unplugged"),
        )
        .await;

    // No external shutdown: the lost sensor has to end the run
    let monitor = rig.monitor(ScriptedSurface::new(grid()));
    let machine = tokio::time::timeout(Duration::from_secs(60), monitor.run(rig.shutdown_rx.clone()))
        .await
        .expect("monitor stopped after losing its sensor");

    assert!(sensors.all_lost());
    assert_eq!(sensors.active(), 0);
    sensors.join().await;

    // Stopped at 0.5s, long before the 2s lock delay
    assert!(matches!(machine.state(), LockState::Active | LockState::Grace));
    assert_eq!(rig.locker.calls(), 0);
    assert!(rig.has(LogCategory::Error, "Sensor test:keyboard stopped: device unplugged"));
    assert!(rig.has(
        LogCategory::Error,
        &format!("Stopping monitoring: {}", MonitorError::NoSensors)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_enrolled_pattern_survives_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCredentialStore::new(dir.path().join("credential.toml"));
    let clock = MonotonicClock::new();

    let mut surface = ScriptedSurface::new(grid());
    surface.push_drag(&[1, 5, 9, 6], DWELL);
    surface.push_drag(&[1, 5, 9, 6], DWELL);

    let mut confirmations = 0;
    let credential =
        enroll_pattern(&mut surface, &clock, CaptureConfig::default(), |notice| {
            if notice == EnrollNotice::FirstCaptured {
                confirmations += 1;
            }
        })
        .await
        .unwrap();
    assert_eq!(confirmations, 1);

    store.store(&credential).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded, credential);
    assert!(loaded.matches(&Pattern::parse("1-5-9-6").unwrap(), true));
    assert!(!loaded.matches(&Pattern::parse("1-5-9").unwrap(), true));

    assert!(store.clear().unwrap());
    assert!(store.load().is_err());
}
