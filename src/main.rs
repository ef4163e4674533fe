//! fingerlock - unattended-session lock utility
//!
//! Watches sensor activity, locks the workstation after a configurable idle
//! delay and asks for the enrolled gesture pattern before unlocking.
//!
//! Module structure:
//! - `domain/` - Core types (Timestamp, Zone, Pattern, LockState)
//! - `io/` - External interfaces (input devices, feed, terminal, status file)
//! - `services/` - Business logic (aggregator, gesture capture, lock machine)
//! - `infra/` - Infrastructure (Config, Clock, Logging, Metrics)

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use fingerlock::domain::LogCategory;
use fingerlock::infra::logging::init_tracing;
use fingerlock::infra::{Config, EventSink, Metrics, MonotonicClock, SharedSink, TracingSink};
use fingerlock::io::{
    read_status, FeedSource, InputDeviceSource, InputListenerSource, StatusWriter, TerminalSurface,
};
use fingerlock::services::credential::CredentialError;
use fingerlock::services::dispatcher::describe_platform;
use fingerlock::services::gesture::{enroll_pattern, EnrollNotice};
use fingerlock::services::{
    spawn_sensors, ActivityAggregator, CaptureConfig, Credential, CredentialStore, DryRunLocker,
    FileCredentialStore, GestureSurface, LockDispatcher, LockMachine, MachineConfig,
    MemoryCredentialStore, Monitor, MonitorError, SensorSource, SessionLocker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Lock the session when you walk away; unlock with a drawn pattern
#[derive(Parser, Debug)]
#[command(name = "fingerlock", version, about)]
struct Cli {
    /// Path to TOML configuration file (default: ~/.fingerlock/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start monitoring (default)
    Start(StartArgs),
    /// Enroll a new unlock pattern
    Enroll,
    /// Remove the enrolled pattern
    Reset,
    /// Show the last known session state
    Status,
    /// Print the end of the log file
    Logs {
        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 30)]
        lines: usize,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug, Default)]
struct StartArgs {
    /// Lock after this many seconds of inactivity
    #[arg(short = 'd', long = "delay")]
    delay: Option<u64>,

    /// Log the lock commands instead of running them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = Config::resolve_config_path(cli.config.as_deref());
    let config = Config::load_from_path(&config_path);

    match cli.command.unwrap_or(Command::Start(StartArgs::default())) {
        Command::Start(args) => cmd_start(config, args).await,
        Command::Enroll => cmd_enroll(config).await,
        Command::Reset => cmd_reset(config),
        Command::Status => cmd_status(config),
        Command::Logs { lines } => cmd_logs(config, lines),
        Command::Config => cmd_config(config),
    }
}

fn capture_config(config: &Config) -> CaptureConfig {
    CaptureConfig { stability_delay: config.stability_delay(), min_points: config.min_points() }
}

/// A `pattern_hash` in the config file wins over the enrolled file
fn credential_store(config: &Config) -> anyhow::Result<Arc<dyn CredentialStore>> {
    if let Some(hash) = config.pattern_hash() {
        let credential = Credential::from_hash(hash)
            .ok_or_else(|| anyhow!("pattern_hash in {} is not a sha256 digest", config.config_file()))?;
        return Ok(Arc::new(MemoryCredentialStore::with_credential(credential)));
    }
    Ok(Arc::new(FileCredentialStore::new(config.credential_path())))
}

async fn cmd_start(config: Config, args: StartArgs) -> anyhow::Result<()> {
    let config = match args.delay {
        Some(seconds) => config.with_lock_delay_seconds(seconds),
        None => config,
    };
    config.validate()?;

    let _log_guard = init_tracing(Some(config.log_path()), true)?;
    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "fingerlock starting");
    info!(
        config_file = %config.config_file(),
        lock_delay_seconds = %config.lock_delay_seconds(),
        platform_lock = %config.platform_lock(),
        tick_ms = %config.tick_interval().as_millis(),
        max_attempts = %config.max_attempts(),
        lockout_policy = ?config.lockout_policy(),
        dry_run = %args.dry_run,
        "config_loaded"
    );

    let sink: SharedSink = Arc::new(TracingSink);
    let credential = match credential_store(&config)?.load() {
        Ok(credential) => credential,
        Err(CredentialError::NotEnrolled) => {
            sink.record(LogCategory::Error, "No pattern enrolled, refusing to start");
            return Err(MonitorError::NotEnrolled.into());
        }
        Err(e) => return Err(e).context("Failed to load credential"),
    };

    let clock = MonotonicClock::new();
    let metrics = Arc::new(Metrics::new());
    let aggregator = Arc::new(ActivityAggregator::new(clock.now()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sources: Vec<Box<dyn SensorSource>> = Vec::new();
    if config.input_listener() {
        sources.push(Box::new(InputListenerSource::new(clock, aggregator.clone(), metrics.clone())));
    }
    if config.input_devices() {
        sources.push(Box::new(InputDeviceSource::new(
            config.input_device_dir(),
            clock,
            aggregator.clone(),
            metrics.clone(),
        )));
    }
    if config.feed_enabled() {
        sources.push(Box::new(FeedSource::new(
            config.feed_bind(),
            clock,
            aggregator.clone(),
            metrics.clone(),
        )));
    }
    let sensors = spawn_sensors(
        sources,
        aggregator.clone(),
        sink.clone(),
        metrics.clone(),
        shutdown_tx.clone(),
    )
    .await?;

    let locker: Arc<dyn SessionLocker> = if args.dry_run {
        Arc::new(DryRunLocker)
    } else {
        Arc::new(LockDispatcher::new(config.command_timeout(), config.timeout_as_success()))
    };

    let machine = LockMachine::new(
        MachineConfig::from_config(&config),
        aggregator,
        locker,
        credential,
        sink.clone(),
        metrics.clone(),
        clock.now(),
    );
    let surface: Box<dyn GestureSurface> = Box::new(TerminalSurface::new("fingerlock"));
    let monitor = Monitor::new(
        machine,
        clock,
        surface,
        capture_config(&config),
        config.tick_interval(),
        sink.clone(),
    )
    .with_status(StatusWriter::new(
        config.status_path(),
        config.platform_lock(),
        config.lock_delay_seconds(),
    ));

    sink.record(
        LogCategory::System,
        &format!(
            "Monitoring started: lock after {}s of inactivity, sensors: {}, backend: {}",
            config.lock_delay_seconds(),
            sensors.attached().join(", "),
            describe_platform(config.platform_lock())
        ),
    );

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = metrics_shutdown.changed() => break,
            }
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    let machine = monitor.run(shutdown_rx).await;
    let sensors_lost = sensors.all_lost();
    sensors.join().await;

    sink.record(
        LogCategory::System,
        &format!("Monitoring stopped in state {}", machine.state()),
    );
    metrics.report().log();
    if sensors_lost {
        return Err(MonitorError::NoSensors.into());
    }
    Ok(())
}

async fn cmd_enroll(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    // The grid owns the terminal; log to file only
    let _log_guard = init_tracing(Some(config.log_path()), false)?;
    let sink = TracingSink;

    if config.pattern_hash().is_some() {
        println!(
            "Note: pattern_hash in {} overrides the enrolled pattern until removed.",
            config.config_file()
        );
    }

    let store = FileCredentialStore::new(config.credential_path());
    let clock = MonotonicClock::new();
    let mut surface = TerminalSurface::new("fingerlock enroll");
    surface.activate().map_err(|e| anyhow!("Cannot open the terminal surface: {}", e))?;
    sink.record(LogCategory::Enroll, "Enrollment started");

    let result = enroll_pattern(&mut surface, &clock, capture_config(&config), |notice| match notice {
        EnrollNotice::FirstCaptured => {
            sink.record(LogCategory::Enroll, "First pattern captured, waiting for confirmation")
        }
        EnrollNotice::Retry(reason) => {
            sink.record(LogCategory::Enroll, &format!("Enrollment restarted: {}", reason))
        }
    })
    .await;
    surface.deactivate();

    let credential = match result {
        Ok(credential) => credential,
        Err(e) => {
            sink.record(LogCategory::Enroll, &format!("Enrollment aborted: {}", e));
            return Err(e).context("Enrollment aborted");
        }
    };
    store
        .store(&credential)
        .with_context(|| format!("Failed to store credential in {}", store.path().display()))?;

    sink.record(LogCategory::Enroll, "Pattern enrolled");
    println!("Pattern enrolled. Hash stored in {}", store.path().display());
    Ok(())
}

fn cmd_reset(config: Config) -> anyhow::Result<()> {
    let _log_guard = init_tracing(Some(config.log_path()), false)?;
    let store = FileCredentialStore::new(config.credential_path());

    if store.clear().context("Failed to remove credential")? {
        TracingSink.record(LogCategory::System, "Enrolled pattern removed");
        println!("Enrolled pattern removed. Run `fingerlock enroll` to set a new one.");
    } else {
        println!("No enrolled pattern at {}", store.path().display());
    }
    if config.pattern_hash().is_some() {
        println!("Note: pattern_hash is still set in {}", config.config_file());
    }
    Ok(())
}

fn cmd_status(config: Config) -> anyhow::Result<()> {
    let enrolled = match credential_store(&config)?.load() {
        Ok(_) => "enrolled",
        Err(CredentialError::NotEnrolled) => "not enrolled",
        Err(_) => "unreadable",
    };

    match read_status(config.status_path())? {
        Some(status) => {
            println!("State:         {}", status.state);
            println!("Attempts:      {}", status.attempt_count);
            println!("Lock delay:    {}s", status.lock_delay_seconds);
            println!("Updated:       {}", status.updated_at.to_rfc3339());
        }
        None => println!("State:         not running"),
    }
    println!("Platform:      {}", config.platform_lock());
    println!("Lock backend:  {}", describe_platform(config.platform_lock()));
    println!("Credential:    {}", enrolled);
    Ok(())
}

fn cmd_logs(config: Config, lines: usize) -> anyhow::Result<()> {
    let path = config.log_path();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No log file at {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let all: Vec<&str> = content.lines().collect();
    for line in &all[all.len().saturating_sub(lines)..] {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_config(config: Config) -> anyhow::Result<()> {
    println!("# source: {}", config.config_file());
    print!("{}", config.to_toml_string()?);
    Ok(())
}
