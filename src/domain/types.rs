//! Shared types for the lock utility

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Milliseconds on the process-local monotonic clock
///
/// Produced by `infra::clock::MonotonicClock`; never compared against wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(self, duration: Duration) -> Timestamp {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(ms))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// One activity report from a sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub source_tag: String,
    pub timestamp: Timestamp,
}

impl ActivityEvent {
    pub fn new(source_tag: impl Into<String>, timestamp: Timestamp) -> Self {
        Self { source_tag: source_tag.into(), timestamp }
    }
}

/// Cell of the 3x3 gesture grid, numbered like a numeric keypad (7 8 9 on top)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Zone(u8);

impl Zone {
    pub fn new(id: u8) -> Option<Zone> {
        (1..=9).contains(&id).then_some(Zone(id))
    }

    pub fn id(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern needs at least {min} zones, got {len}")]
    TooShort { len: usize, min: usize },
    #[error("zone id {0} is outside the 3x3 grid")]
    InvalidZone(String),
    #[error("zone {zone} repeats at position {position}")]
    Repeated { zone: u8, position: usize },
    #[error("zone {zone} backtracks at position {position}")]
    Backtrack { zone: u8, position: usize },
}

/// Ordered, validated zone sequence drawn by the user
///
/// Invariants: at least `Pattern::MIN_LEN` zones, no zone equal to the one
/// before it, no zone equal to the one two positions back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    zones: SmallVec<[Zone; 9]>,
}

impl Pattern {
    pub const MIN_LEN: usize = 3;
    /// Separator used for the canonical serialization that gets hashed
    pub const SEPARATOR: &'static str = "-";

    pub fn from_zones(zones: &[Zone]) -> Result<Pattern, PatternError> {
        if zones.len() < Self::MIN_LEN {
            return Err(PatternError::TooShort { len: zones.len(), min: Self::MIN_LEN });
        }
        for (position, zone) in zones.iter().enumerate() {
            if position >= 1 && zones[position - 1] == *zone {
                return Err(PatternError::Repeated { zone: zone.id(), position });
            }
            if position >= 2 && zones[position - 2] == *zone {
                return Err(PatternError::Backtrack { zone: zone.id(), position });
            }
        }
        Ok(Pattern { zones: SmallVec::from_slice(zones) })
    }

    /// Parse the canonical `1-2-3` form
    pub fn parse(text: &str) -> Result<Pattern, PatternError> {
        let zones = text
            .split(Self::SEPARATOR)
            .map(|part| {
                part.trim()
                    .parse::<u8>()
                    .ok()
                    .and_then(Zone::new)
                    .ok_or_else(|| PatternError::InvalidZone(part.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_zones(&zones)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Deterministic serialization: zone ids joined by `-`
    pub fn serialize(&self) -> String {
        self.zones.iter().map(|z| z.id().to_string()).collect::<Vec<_>>().join(Self::SEPARATOR)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.zones.iter().map(|z| z.to_string()).collect::<Vec<_>>().join(" → ");
        f.write_str(&joined)
    }
}

/// Pointer input for gesture capture, in surface coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Press { x: f64, y: f64 },
    Move { x: f64, y: f64 },
    Release,
    /// Secondary action: abort the drag in progress
    Cancel,
}

/// Lock session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Active,
    Grace,
    Locked,
    Authenticating,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Active => "ACTIVE",
            LockState::Grace => "GRACE",
            LockState::Locked => "LOCKED",
            LockState::Authenticating => "AUTHENTICATING",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating system family with a lock command table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
}

impl Platform {
    /// Platform of the running binary, `None` when no lock table exists for it
    pub fn detect() -> Option<Platform> {
        if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else if cfg!(target_os = "macos") {
            Some(Platform::Macos)
        } else if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Macos => "macos",
            Platform::Linux => "linux",
        }
    }
}

/// `platform_lock` configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformSetting {
    #[default]
    Auto,
    Windows,
    Macos,
    Linux,
}

impl PlatformSetting {
    pub fn resolve(self) -> Option<Platform> {
        match self {
            PlatformSetting::Auto => Platform::detect(),
            PlatformSetting::Windows => Some(Platform::Windows),
            PlatformSetting::Macos => Some(Platform::Macos),
            PlatformSetting::Linux => Some(Platform::Linux),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformSetting::Auto => "auto",
            PlatformSetting::Windows => "windows",
            PlatformSetting::Macos => "macos",
            PlatformSetting::Linux => "linux",
        }
    }
}

impl fmt::Display for PlatformSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category attached to every user-facing log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    Presence,
    Absence,
    Lock,
    System,
    Enroll,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Presence => "PRESENCE",
            LogCategory::Absence => "ABSENCE",
            LogCategory::Lock => "LOCK",
            LogCategory::System => "SYSTEM",
            LogCategory::Enroll => "ENROLL",
            LogCategory::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
