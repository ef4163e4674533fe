//! Lock cycle simulator
//!
//! Runs the real monitor against a scripted sensor and a scripted gesture
//! surface, with lock commands replaced by a dry run. Useful to watch the
//! transition log without touching the desktop session.
//!
//! Timeline (defaults):
//! - keyboard activity at 0.5s and 1.0s, then silence
//! - GRACE, then LOCKED once the lock delay has elapsed
//! - keyboard activity at 4.0s opens the unlock challenge
//! - `--wrong` wrong patterns, then the enrolled one
//!
//! Usage:
//!   cargo run --bin fingerlock-sim -- --delay 2 --wrong 1

use clap::Parser;
use fingerlock::domain::{Pattern, PointerEvent};
use fingerlock::infra::logging::init_tracing;
use fingerlock::infra::{Config, LockoutMode, Metrics, MonotonicClock, RecordingSink, SharedSink};
use fingerlock::services::{
    spawn_sensors, ActivityAggregator, CaptureConfig, Credential, DryRunLocker, LockMachine,
    MachineConfig, Monitor, ScriptedSource, ScriptedSurface, SensorSource, ZoneGrid,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const ENROLLED: [u8; 4] = [7, 5, 3, 6];
const ENROLLED_TEXT: &str = "7-5-3-6";
const WRONG: [u8; 3] = [1, 2, 3];

#[derive(Parser, Debug)]
#[command(name = "fingerlock-sim", about = "Replay a scripted lock/unlock cycle")]
struct Args {
    /// Lock delay in seconds
    #[arg(short, long, default_value_t = 2)]
    delay: u64,

    /// Wrong patterns drawn before the enrolled one
    #[arg(short, long, default_value_t = 1)]
    wrong: usize,

    /// Escalate lockouts instead of re-arming
    #[arg(long)]
    escalate: bool,

    /// Total run time in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(None, true)?;

    let defaults = Config::default();
    let machine_config = MachineConfig {
        lock_delay: Duration::from_secs(args.delay.max(1)),
        lockout: if args.escalate { LockoutMode::Escalate } else { LockoutMode::Rearm },
        cooldown: Duration::from_secs(2),
        max_cooldown: Duration::from_secs(8),
        ..MachineConfig::default()
    };
    info!(
        lock_delay_secs = %machine_config.lock_delay.as_secs(),
        wrong = %args.wrong,
        lockout = ?machine_config.lockout,
        "simulation_started"
    );

    let enrolled = Pattern::parse(ENROLLED_TEXT)?;
    let credential = Credential::from_pattern(&enrolled);

    let clock = MonotonicClock::new();
    let metrics = Arc::new(Metrics::new());
    let aggregator = Arc::new(ActivityAggregator::new(clock.now()));
    let recorder = Arc::new(RecordingSink::forwarding());
    let sink: SharedSink = recorder.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let keyboard = ScriptedSource::new(
        "sim:keyboard",
        clock,
        vec![Duration::from_millis(500), Duration::from_millis(500), Duration::from_millis(3000)],
    );
    let sources: Vec<Box<dyn SensorSource>> = vec![Box::new(keyboard)];
    let sensors =
        spawn_sensors(sources, aggregator.clone(), sink.clone(), metrics.clone(), shutdown_tx.clone())
            .await?;

    let grid = ZoneGrid::new(300.0, 300.0);
    let mut surface = ScriptedSurface::new(grid);
    let dwell = defaults.stability_delay() + Duration::from_millis(50);
    // A release with nothing pressed is ignored; it just delays the first drag
    surface.push(Duration::from_millis(500), PointerEvent::Release);
    for _ in 0..args.wrong {
        surface.push_drag(&WRONG, dwell);
    }
    surface.push_drag(&ENROLLED, dwell);

    let machine = LockMachine::new(
        machine_config,
        aggregator,
        Arc::new(DryRunLocker),
        credential,
        sink.clone(),
        metrics.clone(),
        clock.now(),
    );
    let monitor = Monitor::new(
        machine,
        clock,
        Box::new(surface),
        CaptureConfig { stability_delay: defaults.stability_delay(), min_points: defaults.min_points() },
        Duration::from_millis(100),
        sink,
    );

    let duration = Duration::from_secs(args.duration);
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = shutdown_tx.send(true);
    });

    let machine = monitor.run(shutdown_rx).await;
    sensors.join().await;

    println!();
    println!("{:<10} message", "category");
    for (category, message) in recorder.entries() {
        println!("{:<10} {}", category.as_str(), message);
    }
    println!();
    println!(
        "final state {} | lock commands {} | wrong patterns {} | lockouts {} | unlocks {}",
        machine.state(),
        metrics.lock_dispatches(),
        metrics.attempts_rejected(),
        metrics.lockouts_total(),
        metrics.unlocks_total()
    );
    Ok(())
}
