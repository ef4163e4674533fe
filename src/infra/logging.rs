//! Tracing setup and the categorized event sink
//!
//! Console output goes through `tracing-subscriber` (RUST_LOG, default info).
//! The log file gets a plain-text copy through a non-blocking
//! `tracing-appender` writer; the returned guard must live until exit.
//!
//! Components never log user-facing events directly: they receive an
//! `EventSink` and call `record(category, message)`.

use crate::domain::types::LogCategory;
use anyhow::Context;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::macros::format_description;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Console output is dropped while a full-screen surface owns the terminal
static CONSOLE_PAUSED: AtomicBool = AtomicBool::new(false);

pub fn set_console_paused(paused: bool) {
    CONSOLE_PAUSED.store(paused, Ordering::Relaxed);
}

/// Install the global subscriber
pub fn init_tracing(log_path: Option<&Path>, console: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = console.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout.with_filter(|_| !CONSOLE_PAUSED.load(Ordering::Relaxed)))
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
    });

    let (file_layer, guard) = match log_path {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("Log path {} has no file name", path.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_timer(UtcTime::new(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second]"
                )));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Receiver of categorized, human-readable events
pub trait EventSink: Send + Sync {
    fn record(&self, category: LogCategory, message: &str);
}

/// Forwards events to `tracing` with the category as a structured field
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, category: LogCategory, message: &str) {
        let category = category.as_str();
        match category {
            "ERROR" => error!(category = %category, "{}", message),
            "LOCK" | "ABSENCE" => warn!(category = %category, "{}", message),
            _ => info!(category = %category, "{}", message),
        }
    }
}

/// Keeps every event in memory; used by tests and the simulator
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: parking_lot::Mutex<Vec<(LogCategory, String)>>,
    forward: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forward every event to `TracingSink`
    pub fn forwarding() -> Self {
        Self { entries: parking_lot::Mutex::new(Vec::new()), forward: true }
    }

    pub fn entries(&self) -> Vec<(LogCategory, String)> {
        self.entries.lock().clone()
    }

    pub fn count(&self, category: LogCategory) -> usize {
        self.entries.lock().iter().filter(|(c, _)| *c == category).count()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, category: LogCategory, message: &str) {
        if self.forward {
            TracingSink.record(category, message);
        }
        self.entries.lock().push((category, message.to_string()));
    }
}

pub type SharedSink = Arc<dyn EventSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_counts_by_category() {
        let sink = RecordingSink::new();
        sink.record(LogCategory::Lock, "locked");
        sink.record(LogCategory::Error, "failed");
        sink.record(LogCategory::Lock, "locked again");

        assert_eq!(sink.count(LogCategory::Lock), 2);
        assert_eq!(sink.count(LogCategory::Error), 1);
        assert_eq!(sink.entries()[1], (LogCategory::Error, "failed".to_string()));
    }
}
