//! Raw input-device poller (Linux evdev)
//!
//! Optional companion to the keyboard/pointer listener for consoles without
//! a display server. Reads kernel `input_event` records from every `event*` node under the
//! configured directory. Key, relative and absolute events count as
//! activity; sync events are ignored. Reads can split records, so each
//! device keeps a persistent reassembly buffer.
//!
//! Record layout: `struct timeval` (two native longs), then
//! `u16 type`, `u16 code`, `i32 value`, all in native byte order.

use crate::domain::types::ActivityEvent;
use crate::infra::clock::MonotonicClock;
use crate::infra::metrics::Metrics;
use crate::services::aggregator::ActivityAggregator;
use crate::services::sensor::{
    ActivityThrottle, SensorError, SensorSignal, SensorSource, SignalForwarder,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

#[cfg(target_pointer_width = "64")]
pub const RECORD_LEN: usize = 24;
#[cfg(not(target_pointer_width = "64"))]
pub const RECORD_LEN: usize = 16;

/// `type` follows the timeval
const TYPE_OFFSET: usize = RECORD_LEN - 8;

/// Reports closer together than this are merged into one
const COALESCE_GAP: Duration = Duration::from_millis(50);
const DEVICE_CHANNEL_CAPACITY: usize = 64;

/// Splits a byte stream into input records and counts activity records
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(RECORD_LEN * 4) }
    }

    /// Append `bytes`; returns how many complete records were user input
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        self.buffer.extend_from_slice(bytes);

        let complete = self.buffer.len() / RECORD_LEN * RECORD_LEN;
        let activity = self.buffer[..complete]
            .chunks_exact(RECORD_LEN)
            .filter(|record| is_activity(event_type(record)))
            .count();
        self.buffer.drain(..complete);
        activity
    }

    /// Bytes of an incomplete record waiting for the next read
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn event_type(record: &[u8]) -> u16 {
    u16::from_ne_bytes([record[TYPE_OFFSET], record[TYPE_OFFSET + 1]])
}

fn is_activity(event_type: u16) -> bool {
    matches!(event_type, EV_KEY | EV_REL | EV_ABS)
}

pub struct InputDeviceSource {
    dir: PathBuf,
    clock: MonotonicClock,
    aggregator: Arc<ActivityAggregator>,
    metrics: Arc<Metrics>,
    rx: Option<mpsc::Receiver<SensorSignal>>,
    readers: Vec<JoinHandle<()>>,
}

impl InputDeviceSource {
    pub fn new(
        dir: impl Into<PathBuf>,
        clock: MonotonicClock,
        aggregator: Arc<ActivityAggregator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { dir: dir.into(), clock, aggregator, metrics, rx: None, readers: Vec::new() }
    }

    fn unavailable(&self, reason: String) -> SensorError {
        SensorError::Unavailable { source_tag: "input".to_string(), reason }
    }

    fn device_nodes(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut nodes: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("event"))
            })
            .collect();
        nodes.sort();
        Ok(nodes)
    }
}

#[async_trait]
impl SensorSource for InputDeviceSource {
    fn tag(&self) -> &str {
        "input"
    }

    async fn subscribe(&mut self) -> Result<(), SensorError> {
        if !cfg!(target_os = "linux") {
            return Err(self.unavailable("raw input devices are only read on Linux".to_string()));
        }

        let nodes = Self::device_nodes(&self.dir)
            .map_err(|e| self.unavailable(format!("{}: {}", self.dir.display(), e)))?;

        let (tx, rx) = mpsc::channel(DEVICE_CHANNEL_CAPACITY);
        let forwarder = SignalForwarder::new(tx, self.aggregator.clone(), self.metrics.clone());
        for node in &nodes {
            match tokio::fs::File::open(node).await {
                Ok(file) => {
                    let name = node
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    debug!(device = %node.display(), "input_device_opened");
                    self.readers.push(tokio::spawn(read_device(
                        file,
                        format!("input:{}", name),
                        forwarder.clone(),
                        self.clock,
                    )));
                }
                Err(e) => {
                    debug!(device = %node.display(), error = %e, "input_device_open_failed");
                }
            }
        }

        if self.readers.is_empty() {
            return Err(self.unavailable(format!(
                "no readable event devices in {} ({} found)",
                self.dir.display(),
                nodes.len()
            )));
        }

        info!(devices = %self.readers.len(), dir = %self.dir.display(), "input_devices_attached");
        self.rx = Some(rx);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<SensorSignal>, SensorError> {
        match self.rx.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.rx = None;
    }
}

async fn read_device(
    mut file: tokio::fs::File,
    tag: String,
    forwarder: SignalForwarder,
    clock: MonotonicClock,
) {
    let mut decoder = EventDecoder::new();
    let mut chunk = [0u8; RECORD_LEN * 16];
    let mut throttle = ActivityThrottle::new(COALESCE_GAP);

    loop {
        let n = match file.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(device = %tag, error = %e, "input_device_read_failed");
                break;
            }
        };

        if decoder.push(&chunk[..n]) == 0 {
            continue;
        }
        let now = clock.now();
        if !throttle.admit(now) {
            forwarder.touch(&tag, now);
            continue;
        }
        if !forwarder.forward(SensorSignal::Activity(ActivityEvent::new(tag.clone(), now))) {
            break;
        }
    }

    debug!(device = %tag, "input_device_closed");
}
