//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so sensor tasks never contend with the evaluator.
//! Reporting swaps the periodic counters to zero; totals are monotonic.
//!
//! All atomics use Relaxed ordering: statistical counters only, never read
//! for lock decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector
pub struct Metrics {
    /// Activity signals accepted from all sensors (monotonic)
    activity_total: AtomicU64,
    /// Activity signals since last report (reset on report)
    activity_since_report: AtomicU64,
    /// Sensor signals that bypassed a full channel (monotonic)
    signals_overflowed: AtomicU64,
    /// Lock commands dispatched (monotonic)
    lock_dispatches: AtomicU64,
    /// Dispatches where no candidate command succeeded (monotonic)
    lock_failures: AtomicU64,
    /// Dispatches accepted through the timeout heuristic (monotonic)
    lock_ambiguous: AtomicU64,
    /// Successful unlocks (monotonic)
    unlocks_total: AtomicU64,
    /// Rejected unlock attempts (monotonic)
    attempts_rejected: AtomicU64,
    /// Lockouts after exhausting attempts (monotonic)
    lockouts_total: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            activity_total: AtomicU64::new(0),
            activity_since_report: AtomicU64::new(0),
            signals_overflowed: AtomicU64::new(0),
            lock_dispatches: AtomicU64::new(0),
            lock_failures: AtomicU64::new(0),
            lock_ambiguous: AtomicU64::new(0),
            unlocks_total: AtomicU64::new(0),
            attempts_rejected: AtomicU64::new(0),
            lockouts_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_activity(&self) {
        self.activity_total.fetch_add(1, Ordering::Relaxed);
        self.activity_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_signal_overflow(&self) {
        self.signals_overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_dispatch(&self, locked: bool, ambiguous: bool) {
        self.lock_dispatches.fetch_add(1, Ordering::Relaxed);
        if !locked {
            self.lock_failures.fetch_add(1, Ordering::Relaxed);
        }
        if ambiguous {
            self.lock_ambiguous.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unlock(&self) {
        self.unlocks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt_rejected(&self) {
        self.attempts_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lockout(&self) {
        self.lockouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn activity_total(&self) -> u64 {
        self.activity_total.load(Ordering::Relaxed)
    }

    pub fn signals_overflowed(&self) -> u64 {
        self.signals_overflowed.load(Ordering::Relaxed)
    }

    pub fn lock_dispatches(&self) -> u64 {
        self.lock_dispatches.load(Ordering::Relaxed)
    }

    pub fn lock_failures(&self) -> u64 {
        self.lock_failures.load(Ordering::Relaxed)
    }

    pub fn unlocks_total(&self) -> u64 {
        self.unlocks_total.load(Ordering::Relaxed)
    }

    pub fn attempts_rejected(&self) -> u64 {
        self.attempts_rejected.load(Ordering::Relaxed)
    }

    pub fn lockouts_total(&self) -> u64 {
        self.lockouts_total.load(Ordering::Relaxed)
    }

    /// Snapshot totals and reset the periodic counters
    pub fn report(&self) -> MetricsSummary {
        let activity_count = self.activity_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let activity_per_min = if elapsed.as_secs_f64() > 0.0 {
            activity_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            activity_total: self.activity_total.load(Ordering::Relaxed),
            activity_per_min,
            signals_overflowed: self.signals_overflowed.load(Ordering::Relaxed),
            lock_dispatches: self.lock_dispatches.load(Ordering::Relaxed),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
            lock_ambiguous: self.lock_ambiguous.load(Ordering::Relaxed),
            unlocks_total: self.unlocks_total.load(Ordering::Relaxed),
            attempts_rejected: self.attempts_rejected.load(Ordering::Relaxed),
            lockouts_total: self.lockouts_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view produced by `Metrics::report`
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub activity_total: u64,
    pub activity_per_min: f64,
    pub signals_overflowed: u64,
    pub lock_dispatches: u64,
    pub lock_failures: u64,
    pub lock_ambiguous: u64,
    pub unlocks_total: u64,
    pub attempts_rejected: u64,
    pub lockouts_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            activity_total = %self.activity_total,
            activity_per_min = format!("{:.1}", self.activity_per_min),
            signals_overflowed = %self.signals_overflowed,
            lock_dispatches = %self.lock_dispatches,
            lock_failures = %self.lock_failures,
            lock_ambiguous = %self.lock_ambiguous,
            unlocks = %self.unlocks_total,
            attempts_rejected = %self.attempts_rejected,
            lockouts = %self.lockouts_total,
            "metrics"
        );
    }
}
