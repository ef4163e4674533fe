//! Services - business logic and state management
//!
//! This module contains the core services:
//! - `aggregator` - Lock-free latest-activity aggregation
//! - `sensor` - Sensor source contract and supervisor
//! - `gesture` - Zone-pattern capture and enrollment
//! - `credential` - Pattern hashing and credential storage
//! - `dispatcher` - Platform lock-command chains
//! - `lock_machine` - Lock session state machine
//! - `monitor` - Periodic evaluator and unlock challenges

pub mod aggregator;
pub mod credential;
pub mod dispatcher;
pub mod gesture;
pub mod lock_machine;
pub mod monitor;
pub mod sensor;

// Re-export commonly used types
pub use aggregator::ActivityAggregator;
pub use credential::{Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use dispatcher::{DryRunLocker, LockDispatcher, LockOutcome, SessionLocker};
pub use gesture::{CaptureConfig, GestureSurface, ScriptedSurface, ZoneGrid};
pub use lock_machine::{LockMachine, MachineConfig};
pub use monitor::{Monitor, MonitorError};
pub use sensor::{spawn_sensors, ScriptedSource, SensorSource};
