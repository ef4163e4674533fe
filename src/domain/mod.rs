//! Domain models - core types shared by every component
//!
//! - `Timestamp` - monotonic milliseconds used for all timing decisions
//! - `ActivityEvent` - one sensor report
//! - `Zone` / `Pattern` - gesture grid cells and validated drawn sequences
//! - `LockState` - lock session states
//! - `Platform` / `PlatformSetting` - lock command table selection
//! - `LogCategory` - category of user-facing log records

pub mod types;

pub use types::{
    ActivityEvent, LockState, LogCategory, Pattern, PatternError, Platform, PlatformSetting,
    PointerEvent, Timestamp, Zone,
};
