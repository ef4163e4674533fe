//! External recognizer feed
//!
//! Face/hand recognizers and motion detectors run out of process and report
//! over a local TCP line protocol:
//!
//! ```text
//! ACTIVITY <tag>
//! PRESENCE <tag> [detail]
//! ABSENCE <tag> [detail]
//! ```
//!
//! Signals are tagged `feed:<tag>`. Unknown lines are ignored.

use crate::domain::types::{ActivityEvent, Timestamp};
use crate::infra::clock::MonotonicClock;
use crate::infra::metrics::Metrics;
use crate::services::aggregator::ActivityAggregator;
use crate::services::sensor::{SensorError, SensorSignal, SensorSource, SignalForwarder};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

const FEED_CHANNEL_CAPACITY: usize = 256;
const TAG_PREFIX: &str = "feed:";

/// Parse one protocol line
pub fn parse_feed_line(line: &str, now: Timestamp) -> Option<SensorSignal> {
    let mut parts = line.trim().splitn(3, char::is_whitespace);
    let keyword = parts.next()?;
    let tag = parts.next().filter(|t| !t.is_empty())?;
    let detail = parts.next().map(str::trim).filter(|d| !d.is_empty()).map(str::to_string);
    let source_tag = format!("{}{}", TAG_PREFIX, tag);

    match keyword {
        "ACTIVITY" => Some(SensorSignal::Activity(ActivityEvent::new(source_tag, now))),
        "PRESENCE" => Some(SensorSignal::Presence {
            event: ActivityEvent::new(source_tag, now),
            detail,
        }),
        "ABSENCE" => Some(SensorSignal::Absence { source_tag, detail }),
        _ => None,
    }
}

pub struct FeedSource {
    bind: String,
    clock: MonotonicClock,
    aggregator: Arc<ActivityAggregator>,
    metrics: Arc<Metrics>,
    local_addr: Option<SocketAddr>,
    rx: Option<mpsc::Receiver<SensorSignal>>,
    accept_task: Option<JoinHandle<()>>,
}

impl FeedSource {
    pub fn new(
        bind: impl Into<String>,
        clock: MonotonicClock,
        aggregator: Arc<ActivityAggregator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            bind: bind.into(),
            clock,
            aggregator,
            metrics,
            local_addr: None,
            rx: None,
            accept_task: None,
        }
    }

    /// Bound address once subscribed
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl SensorSource for FeedSource {
    fn tag(&self) -> &str {
        "feed"
    }

    async fn subscribe(&mut self) -> Result<(), SensorError> {
        let listener = TcpListener::bind(&self.bind).await.map_err(|e| SensorError::Unavailable {
            source_tag: "feed".to_string(),
            reason: format!("bind {}: {}", self.bind, e),
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "feed_listener_started");

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let forwarder = SignalForwarder::new(tx, self.aggregator.clone(), self.metrics.clone());
        self.accept_task = Some(tokio::spawn(accept_loop(listener, forwarder, self.clock)));
        self.local_addr = Some(local_addr);
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
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.rx = None;
        info!("feed_listener_closed");
    }
}

async fn accept_loop(listener: TcpListener, forwarder: SignalForwarder, clock: MonotonicClock) {
    // Dropping the set on abort also stops every connection
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((socket, addr)) => {
                    connections.spawn(handle_connection(socket, addr, forwarder.clone(), clock));
                }
                Err(e) => error!(error = %e, "feed_accept_failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    forwarder: SignalForwarder,
    clock: MonotonicClock,
) {
    debug!(peer = %addr, "feed_connection_accepted");
    let mut lines = BufReader::new(socket).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(signal) = parse_feed_line(&line, clock.now()) else {
            debug!(peer = %addr, line = %line.trim(), "feed_line_ignored");
            continue;
        };
        if !forwarder.forward(signal) {
            break;
        }
    }

    debug!(peer = %addr, "feed_connection_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_feed_line() {
        let now = Timestamp::from_millis(42);
        assert_eq!(
            parse_feed_line("ACTIVITY motion", now),
            Some(SensorSignal::Activity(ActivityEvent::new("feed:motion", now)))
        );
        assert_eq!(
            parse_feed_line("PRESENCE face owner dist=0.42\n", now),
            Some(SensorSignal::Presence {
                event: ActivityEvent::new("feed:face", now),
                detail: Some("owner dist=0.42".to_string()),
            })
        );
        assert_eq!(
            parse_feed_line("ABSENCE face", now),
            Some(SensorSignal::Absence { source_tag: "feed:face".to_string(), detail: None })
        );
        assert_eq!(parse_feed_line("ACTIVITY", now), None);
        assert_eq!(parse_feed_line("HELLO world", now), None);
        assert_eq!(parse_feed_line("", now), None);
    }

    #[tokio::test]
    async fn test_feed_source_receives_lines() {
        let mut source = FeedSource::new(
            "127.0.0.1:0",
            MonotonicClock::new(),
            Arc::new(ActivityAggregator::new(Timestamp::ZERO)),
            Arc::new(Metrics::new()),
        );
        source.subscribe().await.unwrap();
        let addr = source.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"NOISE\nACTIVITY keyboard\nABSENCE face gone\n").await.unwrap();

        match source.poll().await.unwrap() {
            Some(SensorSignal::Activity(event)) => assert_eq!(event.source_tag, "feed:keyboard"),
            other => panic!("unexpected signal {:?}", other),
        }
        match source.poll().await.unwrap() {
            Some(SensorSignal::Absence { source_tag, detail }) => {
                assert_eq!(source_tag, "feed:face");
                assert_eq!(detail.as_deref(), Some("gone"));
            }
            other => panic!("unexpected signal {:?}", other),
        }

        source.close().await;
        assert_eq!(source.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bind_failure_is_unavailable() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let mut source = FeedSource::new(
            addr,
            MonotonicClock::new(),
            Arc::new(ActivityAggregator::new(Timestamp::ZERO)),
            Arc::new(Metrics::new()),
        );
        assert!(matches!(source.subscribe().await, Err(SensorError::Unavailable { .. })));
    }
}
