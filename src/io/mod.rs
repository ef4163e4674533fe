//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `input_listener` - Keyboard/pointer listener (global OS input hook)
//! - `input_device` - Raw Linux input-device poller (evdev records)
//! - `feed` - TCP line feed for external recognizers and motion detectors
//! - `terminal` - Terminal gesture surface (crossterm + ratatui)
//! - `status` - Status snapshot file shared with `fingerlock status`

pub mod feed;
pub mod input_device;
pub mod input_listener;
pub mod status;
pub mod terminal;

// Re-export commonly used types
pub use feed::FeedSource;
pub use input_device::InputDeviceSource;
pub use input_listener::InputListenerSource;
pub use status::{read_status, StatusSnapshot, StatusWriter};
pub use terminal::TerminalSurface;
