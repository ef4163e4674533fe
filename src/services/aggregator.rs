//! Latest-activity aggregation across sensors
//!
//! Sensors call `record_activity` concurrently from their own tasks; the
//! evaluator reads `last_activity`. The stored value only moves forward, so
//! a late or out-of-order report can never make the user look idle.

use crate::domain::types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

#[derive(Debug)]
pub struct ActivityAggregator {
    last_activity_ms: AtomicU64,
}

impl ActivityAggregator {
    /// Start with activity recorded at `start` (monitor start counts as presence)
    pub fn new(start: Timestamp) -> Self {
        Self { last_activity_ms: AtomicU64::new(start.as_millis()) }
    }

    /// Raise the last-activity time to `timestamp` if it is newer
    ///
    /// Returns true when the stored value changed.
    pub fn record_activity(&self, source_tag: &str, timestamp: Timestamp) -> bool {
        let new_value = timestamp.as_millis();
        let mut current = self.last_activity_ms.load(Ordering::Acquire);
        while new_value > current {
            match self.last_activity_ms.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(source = %source_tag, at_ms = %new_value, "activity_recorded");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
        false
    }

    pub fn last_activity(&self) -> Timestamp {
        Timestamp::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    /// Time since the last activity, zero if `now` is not after it
    pub fn inactivity_duration(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.last_activity())
    }
}
