//! Evaluator loop
//!
//! Ticks the lock machine on a fixed interval and, while AUTHENTICATING,
//! runs gesture challenges on the surface until the machine leaves that
//! state. Ticks are never re-entered: a slow dispatch or a capture in
//! progress makes the interval skip instead of bursting.

use crate::domain::types::{LockState, LogCategory};
use crate::infra::clock::MonotonicClock;
use crate::infra::logging::SharedSink;
use crate::io::status::StatusWriter;
use crate::services::gesture::{capture_pattern, CaptureConfig, CaptureError, GestureSurface};
use crate::services::lock_machine::{AttemptOutcome, LockMachine};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no sensor is active")]
    NoSensors,
    #[error("no credential enrolled; run `fingerlock enroll` first")]
    NotEnrolled,
}

pub struct Monitor {
    machine: LockMachine,
    clock: MonotonicClock,
    surface: Box<dyn GestureSurface>,
    capture: CaptureConfig,
    tick_interval: Duration,
    sink: SharedSink,
    status: Option<StatusWriter>,
}

impl Monitor {
    pub fn new(
        machine: LockMachine,
        clock: MonotonicClock,
        surface: Box<dyn GestureSurface>,
        capture: CaptureConfig,
        tick_interval: Duration,
        sink: SharedSink,
    ) -> Self {
        Self { machine, clock, surface, capture, tick_interval, sink, status: None }
    }

    pub fn with_status(mut self, writer: StatusWriter) -> Self {
        self.status = Some(writer);
        self
    }

    pub fn machine(&self) -> &LockMachine {
        &self.machine
    }

    /// Run until shutdown; returns the machine for inspection
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LockMachine {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tick_ms = %self.tick_interval.as_millis(), "monitor_started");
        self.write_status();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let transitions = self.machine.tick(self.clock.now()).await;
                    if !transitions.is_empty() {
                        self.write_status();
                    }
                    if self.machine.state() == LockState::Authenticating
                        && !self.run_challenge(&mut shutdown).await
                    {
                        break;
                    }
                }
            }
        }

        if let Some(status) = &self.status {
            status.clear();
        }
        info!(state = %self.machine.state(), "monitor_stopped");
        self.machine
    }

    /// Capture patterns until the machine leaves AUTHENTICATING
    ///
    /// Returns false when shutdown interrupted the challenge.
    async fn run_challenge(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if let Err(e) = self.surface.activate() {
            self.sink.record(LogCategory::Error, &format!("Unlock surface unavailable: {}", e));
            self.machine.abort_challenge(self.clock.now()).await;
            self.write_status();
            return true;
        }

        while self.machine.state() == LockState::Authenticating {
            let session = self.machine.session();
            let left = self.machine.config().max_attempts.saturating_sub(session.attempt_count);
            self.surface.show_prompt(&format!(
                "Session locked. Draw your unlock pattern ({} attempts left)",
                left
            ));

            let result = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.surface.deactivate();
                        return false;
                    }
                    continue;
                }
                result = capture_pattern(self.surface.as_mut(), &self.clock, self.capture) => result,
            };

            let now = self.clock.now();
            match result {
                Ok(pattern) => match self.machine.submit_attempt(&pattern, now).await {
                    AttemptOutcome::Accepted => self.surface.show_prompt("Unlocked"),
                    AttemptOutcome::Rejected { attempts_left } => self.surface.show_prompt(
                        &format!("Wrong pattern, {} attempts left", attempts_left),
                    ),
                    AttemptOutcome::LockedOut { cooldown } => self.surface.show_prompt(&format!(
                        "Too many attempts, try again in {}s",
                        cooldown.as_secs()
                    )),
                    AttemptOutcome::NotChallenged => {}
                },
                Err(CaptureError::TooShort { points, min_points }) => {
                    self.sink.record(
                        LogCategory::System,
                        &format!(
                            "Pattern too short ({} of {} points), not counted",
                            points, min_points
                        ),
                    );
                }
                Err(CaptureError::Cancelled) | Err(CaptureError::SurfaceClosed) => {
                    self.machine.abort_challenge(now).await;
                }
            }
            self.write_status();
        }

        self.surface.deactivate();
        true
    }

    fn write_status(&self) {
        let Some(status) = &self.status else {
            return;
        };
        let session = self.machine.session();
        if let Err(e) = status.write(session.state, session.attempt_count) {
            warn!(error = %e, path = %status.path().display(), "status_write_failed");
        }
    }
}
