//! Infrastructure - configuration, clock, logging, and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `clock` - Monotonic millisecond clock
//! - `logging` - Tracing setup and the categorized event sink
//! - `metrics` - Lock-free metrics collection

pub mod clock;
pub mod config;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use clock::MonotonicClock;
pub use config::{Config, LockoutMode};
pub use logging::{EventSink, RecordingSink, SharedSink, TracingSink};
pub use metrics::Metrics;
