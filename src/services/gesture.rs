//! Gesture capture on a 3x3 zone grid
//!
//! `GestureCapture` turns press/move/release edges into a stabilized zone
//! pattern. A zone is appended only after the pointer has dwelt in it for
//! `stability_delay`, and never when it equals either of the last two
//! appended zones. The same capture drives enrollment and unlock challenges.
//!
//! Surfaces (terminal, scripted) only deliver `PointerEvent`s; redraw is
//! their own concern and never feeds back into capture.

use crate::domain::types::{Pattern, PointerEvent, Timestamp, Zone};
use crate::infra::clock::MonotonicClock;
use crate::services::credential::Credential;
use async_trait::async_trait;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("pattern too short: {points} points, need {min_points}")]
    TooShort { points: usize, min_points: usize },
    #[error("capture cancelled")]
    Cancelled,
    #[error("gesture surface closed")]
    SurfaceClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrollError {
    #[error("patterns do not match")]
    Mismatch,
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Maps surface coordinates to zones
///
/// Numeric-keypad layout: the top row is 7 8 9, the bottom row 1 2 3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneGrid {
    pub width: f64,
    pub height: f64,
}

impl ZoneGrid {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn zone_at(&self, x: f64, y: f64) -> Option<Zone> {
        if self.width <= 0.0 || self.height <= 0.0 || !x.is_finite() || !y.is_finite() {
            return None;
        }
        let col = cell_index(x, self.width);
        let row_from_top = cell_index(y, self.height);
        let row_from_bottom = 2 - row_from_top;
        Zone::new(row_from_bottom * 3 + col + 1)
    }

    /// Center of `zone` in surface coordinates
    pub fn center_of(&self, zone: Zone) -> (f64, f64) {
        let index = zone.id() - 1;
        let col = f64::from(index % 3);
        let row_from_top = f64::from(2 - index / 3);
        (
            (col + 0.5) * self.width / 3.0,
            (row_from_top + 0.5) * self.height / 3.0,
        )
    }
}

fn cell_index(position: f64, extent: f64) -> u8 {
    let cell = (position / (extent / 3.0)).floor();
    cell.clamp(0.0, 2.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub stability_delay: Duration,
    pub min_points: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { stability_delay: Duration::from_millis(150), min_points: Pattern::MIN_LEN }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    zone: Zone,
    entered_at: Timestamp,
    /// Zone already confirmed (or refused) for this visit
    settled: bool,
}

/// Zone-sequence recognizer for one drag
#[derive(Debug)]
pub struct GestureCapture {
    config: CaptureConfig,
    points: SmallVec<[Zone; 9]>,
    tracked: Option<Tracked>,
}

impl GestureCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config, points: SmallVec::new(), tracked: None }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracked.is_some()
    }

    pub fn points(&self) -> &[Zone] {
        &self.points
    }

    /// Start a drag: the pressed zone is the first point
    pub fn press(&mut self, zone: Zone, now: Timestamp) {
        self.points.clear();
        self.points.push(zone);
        self.tracked = Some(Tracked { zone, entered_at: now, settled: true });
    }

    /// Pointer moved; returns the zone appended by this move, if any
    pub fn move_to(&mut self, zone: Zone, now: Timestamp) -> Option<Zone> {
        let tracked = self.tracked.as_mut()?;

        if tracked.zone != zone {
            *tracked = Tracked { zone, entered_at: now, settled: false };
            return None;
        }
        if tracked.settled || now.saturating_since(tracked.entered_at) < self.config.stability_delay {
            return None;
        }

        tracked.settled = true;
        let len = self.points.len();
        let last = len.checked_sub(1).map(|i| self.points[i]);
        let second_last = len.checked_sub(2).map(|i| self.points[i]);
        if last == Some(zone) || second_last == Some(zone) {
            debug!(zone = %zone, "gesture_zone_refused");
            return None;
        }

        self.points.push(zone);
        debug!(zone = %zone, points = %self.points.len(), "gesture_zone_confirmed");
        Some(zone)
    }

    /// End the drag; `None` when no drag was in progress
    pub fn release(&mut self) -> Option<Result<Pattern, CaptureError>> {
        self.tracked.take()?;
        let points = std::mem::take(&mut self.points);

        if points.len() < self.config.min_points.max(Pattern::MIN_LEN) {
            return Some(Err(CaptureError::TooShort {
                points: points.len(),
                min_points: self.config.min_points,
            }));
        }
        // Capture rules already guarantee the pattern invariants
        Some(Pattern::from_zones(&points).map_err(|_| CaptureError::TooShort {
            points: points.len(),
            min_points: self.config.min_points,
        }))
    }

    /// Abort the drag and discard every point
    pub fn cancel(&mut self) {
        self.tracked = None;
        self.points.clear();
    }
}

/// Where pointer input comes from and where prompts go
#[async_trait]
pub trait GestureSurface: Send {
    fn grid(&self) -> ZoneGrid;

    /// Next pointer event, `None` when the surface is gone
    async fn next_event(&mut self) -> Option<PointerEvent>;

    fn show_prompt(&mut self, prompt: &str);

    fn show_progress(&mut self, zones: &[Zone]);

    fn activate(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn deactivate(&mut self) {}
}

/// Run one capture against `surface`
///
/// Events outside the grid are ignored. A release without any prior press
/// is ignored too.
pub async fn capture_pattern(
    surface: &mut dyn GestureSurface,
    clock: &MonotonicClock,
    config: CaptureConfig,
) -> Result<Pattern, CaptureError> {
    let mut capture = GestureCapture::new(config);

    loop {
        let Some(event) = surface.next_event().await else {
            return Err(CaptureError::SurfaceClosed);
        };
        let grid = surface.grid();
        let now = clock.now();

        match event {
            PointerEvent::Press { x, y } => {
                if let Some(zone) = grid.zone_at(x, y) {
                    capture.press(zone, now);
                    surface.show_progress(capture.points());
                }
            }
            PointerEvent::Move { x, y } => {
                if let Some(zone) = grid.zone_at(x, y) {
                    if capture.move_to(zone, now).is_some() {
                        surface.show_progress(capture.points());
                    }
                }
            }
            PointerEvent::Release => {
                if let Some(result) = capture.release() {
                    surface.show_progress(&[]);
                    return result;
                }
            }
            PointerEvent::Cancel => {
                capture.cancel();
                surface.show_progress(&[]);
                return Err(CaptureError::Cancelled);
            }
        }
    }
}

/// Two-capture enrollment bookkeeping
#[derive(Debug, Default)]
pub struct Enrollment {
    first: Option<Pattern>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollStep {
    AwaitingConfirmation,
    Enrolled(Credential),
}

impl Enrollment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn awaiting_confirmation(&self) -> bool {
        self.first.is_some()
    }

    /// Feed one accepted capture; a mismatch discards both captures
    pub fn submit(&mut self, pattern: Pattern) -> Result<EnrollStep, EnrollError> {
        match self.first.take() {
            None => {
                self.first = Some(pattern);
                Ok(EnrollStep::AwaitingConfirmation)
            }
            Some(first) if first == pattern => Ok(EnrollStep::Enrolled(Credential::from_pattern(&pattern))),
            Some(_) => Err(EnrollError::Mismatch),
        }
    }

    pub fn reset(&mut self) {
        self.first = None;
    }
}

/// Drive enrollment on `surface` until two captures agree
///
/// Short, cancelled and mismatched captures restart the protocol; only a
/// closed surface aborts it.
pub async fn enroll_pattern(
    surface: &mut dyn GestureSurface,
    clock: &MonotonicClock,
    config: CaptureConfig,
    mut on_event: impl FnMut(EnrollNotice<'_>),
) -> Result<Credential, EnrollError> {
    let mut enrollment = Enrollment::new();

    loop {
        let prompt = if enrollment.awaiting_confirmation() {
            "Draw the same pattern again to confirm"
        } else {
            "Draw your unlock pattern (at least 3 zones)"
        };
        surface.show_prompt(prompt);

        let pattern = match capture_pattern(surface, clock, config).await {
            Ok(pattern) => pattern,
            Err(CaptureError::SurfaceClosed) => return Err(CaptureError::SurfaceClosed.into()),
            Err(e) => {
                on_event(EnrollNotice::Retry(&e.to_string()));
                enrollment.reset();
                continue;
            }
        };

        match enrollment.submit(pattern) {
            Ok(EnrollStep::AwaitingConfirmation) => on_event(EnrollNotice::FirstCaptured),
            Ok(EnrollStep::Enrolled(credential)) => return Ok(credential),
            Err(e) => {
                on_event(EnrollNotice::Retry(&e.to_string()));
            }
        }
    }
}

/// Progress reported by `enroll_pattern`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollNotice<'a> {
    FirstCaptured,
    Retry(&'a str),
}

/// Replays pointer events with delays; for tests and the simulator
pub struct ScriptedSurface {
    grid: ZoneGrid,
    steps: VecDeque<(Duration, PointerEvent)>,
    prompts: Vec<String>,
    progress: Vec<Vec<Zone>>,
    activations: usize,
}

impl ScriptedSurface {
    pub fn new(grid: ZoneGrid) -> Self {
        Self {
            grid,
            steps: VecDeque::new(),
            prompts: Vec::new(),
            progress: Vec::new(),
            activations: 0,
        }
    }

    pub fn push(&mut self, delay: Duration, event: PointerEvent) -> &mut Self {
        self.steps.push_back((delay, event));
        self
    }

    /// Queue a full drag through `zone_ids`, dwelling `dwell` in each zone
    ///
    /// Each zone gets an entry move plus a second move after the dwell so
    /// the capture can confirm it.
    pub fn push_drag(&mut self, zone_ids: &[u8], dwell: Duration) -> &mut Self {
        let centers: Vec<(f64, f64)> = zone_ids
            .iter()
            .filter_map(|&id| Zone::new(id))
            .map(|zone| self.grid.center_of(zone))
            .collect();

        for (index, &(x, y)) in centers.iter().enumerate() {
            if index == 0 {
                self.push(Duration::ZERO, PointerEvent::Press { x, y });
            } else {
                self.push(Duration::from_millis(10), PointerEvent::Move { x, y });
            }
            self.push(dwell, PointerEvent::Move { x, y });
        }
        self.push(Duration::from_millis(10), PointerEvent::Release)
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn progress(&self) -> &[Vec<Zone>] {
        &self.progress
    }

    pub fn activations(&self) -> usize {
        self.activations
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

#[async_trait]
impl GestureSurface for ScriptedSurface {
    fn grid(&self) -> ZoneGrid {
        self.grid
    }

    async fn next_event(&mut self) -> Option<PointerEvent> {
        let (delay, event) = self.steps.pop_front()?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Some(event)
    }

    fn show_prompt(&mut self, prompt: &str) {
        self.prompts.push(prompt.to_string());
    }

    fn show_progress(&mut self, zones: &[Zone]) {
        self.progress.push(zones.to_vec());
    }

    fn activate(&mut self) -> Result<(), CaptureError> {
        self.activations += 1;
        Ok(())
    }
}
